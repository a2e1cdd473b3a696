//! Opaque deployment template handling.
//!
//! Template generation is an external collaborator; the pipeline treats the
//! template and its parameters as untyped key-value maps and only mutates the
//! pool count/offset knobs before redeploying.

use jiff::Zoned;
use rand::Rng;
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::model::ClusterModel;

/// An untyped template or parameter document.
pub type TemplateMap = Map<String, Value>;

/// A generated template/parameters pair ready for deployment.
#[derive(Debug, Clone, Default)]
pub struct DeploymentTemplate {
    pub template: TemplateMap,
    pub parameters: TemplateMap,
}

impl DeploymentTemplate {
    /// Point the template at a single master index: the deployment recreates
    /// exactly the master with that index.
    pub fn set_master_window(&mut self, index: usize) -> Result<()> {
        let variables = self.variables_mut()?;
        variables.insert("masterOffset".to_string(), json!(index));
        variables.insert("masterCount".to_string(), json!(index + 1));
        Ok(())
    }

    /// Point the template at a single agent index within the named pool.
    pub fn set_agent_window(&mut self, pool_name: &str, index: usize) -> Result<()> {
        let count_key = format!("{pool_name}Count");
        let count = self
            .parameters
            .get_mut(&count_key)
            .and_then(Value::as_object_mut)
            .ok_or_else(|| Error::Template(format!("missing {count_key} parameter")))?;
        count.insert("value".to_string(), json!(index + 1));

        let offset_key = format!("{pool_name}Offset");
        self.variables_mut()?.insert(offset_key, json!(index));
        Ok(())
    }

    fn variables_mut(&mut self) -> Result<&mut TemplateMap> {
        self.template
            .get_mut("variables")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| Error::Template("template has no variables section".to_string()))
    }
}

/// External producer of the declarative deployment template for the target
/// cluster state.
pub trait TemplateGenerator: Send + Sync {
    fn generate(&self, model: &ClusterModel) -> Result<DeploymentTemplate>;
}

/// Generate a unique, timestamped deployment name with the given prefix.
pub fn deployment_name(prefix: &str) -> String {
    let stamp = Zoned::now().strftime("%y-%m-%dT%H.%M.%S");
    let suffix: u32 = rand::rng().random();
    format!("{prefix}-{stamp}-{suffix}")
}

//! One installer session: configuration, shared context, event bus and a
//! workflow with every configured flow registered.

use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::context::InstallContext;
use crate::error::{InstallError, Result};
use crate::events::EventBus;
use crate::privilege::needs_privilege;
use crate::registry::Registries;
use crate::workflow::{Flow, Workflow};

pub struct Session {
    config: Config,
    workflow: Workflow,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("product", &self.config.product.name)
            .field("flows", &self.workflow.flow_ids())
            .finish()
    }
}

impl Session {
    /// Validate `config`, seed a fresh context and register every flow.
    ///
    /// Unknown task, guard and screen types are reported here.
    pub fn new(config: Config, registries: Arc<Registries>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| InstallError::config(format!("{e:#}")))?;

        let ctx = Arc::new(InstallContext::new());
        let bus = Arc::new(EventBus::new());
        ctx.set_event_bus(Arc::clone(&bus));
        config.apply_to_context(&ctx);

        let mut workflow = Workflow::new(Arc::clone(&ctx), bus, registries);
        for (flow_id, flow_config) in config.all_flows() {
            workflow.add_flow(Flow::from_config(&flow_id, &flow_config, &ctx))?;
        }
        tracing::info!(
            "Session ready for {} ({} flow(s))",
            config.product.name,
            workflow.flow_ids().len()
        );

        Ok(Self { config, workflow })
    }

    /// Load, validate and register a configuration file
    pub fn from_file(path: impl AsRef<Path>, registries: Arc<Registries>) -> Result<Self> {
        let config = Config::load_from_file(path.as_ref())
            .map_err(|e| InstallError::config(format!("{e:#}")))?;
        Self::new(config, registries)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn context(&self) -> &Arc<InstallContext> {
        self.workflow.context()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        self.workflow.event_bus()
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn workflow_mut(&mut self) -> &mut Workflow {
        &mut self.workflow
    }

    /// Returns true if any task in `flow_id` needs root
    pub fn needs_privilege(&self, flow_id: &str) -> bool {
        needs_privilege(&self.config, flow_id)
    }

    /// Apply a `key=value` answer. The value is parsed as JSON when it is
    /// valid JSON (`true`, `42`, `["a"]`), otherwise stored as a string.
    pub fn apply_override(&self, assignment: &str) -> Result<()> {
        let (key, raw) = assignment.split_once('=').ok_or_else(|| {
            InstallError::config(format!("expected key=value, got '{assignment}'"))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(InstallError::config(format!(
                "missing key in '{assignment}'"
            )));
        }
        let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::from(raw));
        tracing::debug!("Override {} = {}", key, value);
        self.context().set(key, value);
        Ok(())
    }
}

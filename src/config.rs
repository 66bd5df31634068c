//! Installer configuration
//!
//! Typed structures for the declarative installer description: product
//! metadata, flows, steps, screens, guards and tasks. Configurations are
//! loaded from JSON with serde and validated before any flow is built.
//!
//! Type names (`"type": "shell"`, `"type": "go:customTask"`) decode straight
//! into `TypeRef`, so nothing downstream re-parses prefixes.

use anyhow::{Context as _, Result as AnyResult, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use strum::{Display, EnumString};

use crate::context::InstallContext;
use crate::error::{InstallError, Result};
use crate::registry::TypeRef;

/// Retry count used when `on_failure: retry` gives no explicit `retries`
pub const DEFAULT_RETRIES: u32 = 3;

/// Flow ID a legacy top-level `flow` is registered under
pub const LEGACY_FLOW_ID: &str = "install";

/// Product metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProductConfig {
    pub name: String,
    pub version: String,
    pub vendor: String,
    pub homepage: String,
    pub license: String,
    pub description: String,
    pub logo: String,
}

/// Per-task failure handling as written in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum OnFailure {
    Abort,
    Skip,
    Rollback,
    /// Shorthand for abort after `retries` extra attempts
    Retry,
}

/// Conditional branching rule for a step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawBranchConfig")]
pub struct BranchConfig {
    /// Context path (or `${...}` template) to evaluate
    pub condition: String,
    /// Stringified condition value → target step ID
    pub branches: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Accepts both `{condition, branches, default}` and the older
/// `{when, then, else}` shape.
#[derive(Deserialize)]
struct RawBranchConfig {
    #[serde(default)]
    condition: String,
    #[serde(default)]
    branches: BTreeMap<String, String>,
    #[serde(default)]
    default: Option<String>,
    #[serde(default)]
    when: Option<String>,
    #[serde(default)]
    then: Option<String>,
    #[serde(default, rename = "else")]
    otherwise: Option<String>,
}

impl From<RawBranchConfig> for BranchConfig {
    fn from(raw: RawBranchConfig) -> Self {
        let mut branch = BranchConfig {
            condition: raw.condition,
            branches: raw.branches,
            default: raw.default.filter(|d| !d.is_empty()),
        };
        if let Some(when) = raw.when.filter(|w| !w.is_empty()) {
            if branch.condition.is_empty() {
                branch.condition = when;
            }
            if let Some(then) = raw.then.filter(|t| !t.is_empty()) {
                branch.branches.entry("true".to_string()).or_insert(then);
            }
            if branch.default.is_none() {
                branch.default = raw.otherwise.filter(|e| !e.is_empty());
            }
        }
        branch
    }
}

impl BranchConfig {
    pub fn new(condition: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            ..Self::default()
        }
    }

    pub fn with_branch(mut self, value: impl Into<String>, target: impl Into<String>) -> Self {
        self.branches.insert(value.into(), target.into());
        self
    }

    pub fn with_default(mut self, target: impl Into<String>) -> Self {
        self.default = Some(target.into());
        self
    }

    /// Every step ID this rule can route to
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.branches
            .values()
            .map(String::as_str)
            .chain(self.default.as_deref())
    }
}

/// One task entry. Parameters other than the reserved keys are kept in
/// `params` and decoded by the task factory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(rename = "type")]
    pub kind: TypeRef,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(
        default,
        alias = "onFailure",
        skip_serializing_if = "Option::is_none"
    )]
    pub on_failure: Option<OnFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl TaskConfig {
    pub fn new(kind: impl Into<TypeRef>) -> Self {
        Self {
            kind: kind.into(),
            id: String::new(),
            on_failure: None,
            retries: None,
            params: Map::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn with_on_failure(mut self, on_failure: OnFailure) -> Self {
        self.on_failure = Some(on_failure);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Task ID, falling back to the type name
    pub fn display_id(&self) -> String {
        if self.id.is_empty() {
            self.kind.name().to_string()
        } else {
            self.id.clone()
        }
    }

    /// Decode the raw parameters into a typed struct
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        self.decode_value(Value::Object(self.params.clone()))
    }

    /// Render every string parameter through the context, then decode
    pub fn decode_rendered<T: DeserializeOwned>(&self, ctx: &InstallContext) -> Result<T> {
        self.decode_value(ctx.render_value(&Value::Object(self.params.clone())))
    }

    fn decode_value<T: DeserializeOwned>(&self, value: Value) -> Result<T> {
        serde_json::from_value(value).map_err(|e| {
            InstallError::config(format!(
                "task '{}' ({}): invalid parameters: {}",
                self.display_id(),
                self.kind,
                e
            ))
        })
    }

    /// Returns true when the task is marked `requirePrivilege: true`
    pub fn requires_privilege(&self) -> bool {
        matches!(self.params.get("requirePrivilege"), Some(Value::Bool(true)))
    }
}

/// One guard entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(rename = "type")]
    pub kind: TypeRef,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl GuardConfig {
    pub fn new(kind: impl Into<TypeRef>) -> Self {
        Self {
            kind: kind.into(),
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// A string parameter; `None` when absent, not a string, or blank
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// The configured user-facing message, if any
    pub fn message(&self) -> Option<&str> {
        self.str_param("message")
    }
}

/// A selectable option on an options screen or select field
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionConfig {
    pub label: String,
    pub value: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub default: bool,
}

/// A form field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldConfig {
    #[serde(rename = "type", default = "default_field_type")]
    pub kind: String,
    #[serde(default)]
    pub label: String,
    pub variable: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hint: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<OptionConfig>,
}

fn default_field_type() -> String {
    "text".to_string()
}

/// Presentation payload for a step. Opaque to navigation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenConfig {
    #[serde(rename = "type")]
    pub kind: TypeRef,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_file: String,
    #[serde(default)]
    pub require_scroll_to_end: bool,
    /// Context path a license/options screen writes its answer to
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<OptionConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldConfig>,
}

impl ScreenConfig {
    pub fn new(kind: impl Into<TypeRef>) -> Self {
        Self {
            kind: kind.into(),
            title: String::new(),
            description: String::new(),
            content: String::new(),
            content_file: String::new(),
            require_scroll_to_end: false,
            bind: String::new(),
            options: Vec::new(),
            fields: Vec::new(),
        }
    }
}

/// One step of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepConfig {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen: Option<ScreenConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guards: Vec<GuardConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<BranchConfig>,
    #[serde(default)]
    pub allow_jump: bool,
}

impl StepConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            screen: None,
            tasks: Vec::new(),
            guards: Vec::new(),
            next: None,
            prev: None,
            branch: None,
            allow_jump: false,
        }
    }
}

/// A flow: ordered steps plus an entry point
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Entry step; empty means the first declared step
    #[serde(default)]
    pub entry: String,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

impl FlowConfig {
    /// Resolved entry step ID
    pub fn entry_step(&self) -> Option<&str> {
        if self.entry.is_empty() {
            self.steps.first().map(|s| s.id.as_str())
        } else {
            Some(self.entry.as_str())
        }
    }
}

/// Complete installer configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "$schema", default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default)]
    pub product: ProductConfig,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flows: BTreeMap<String, FlowConfig>,
    /// Older single-flow layout, registered as `install`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<FlowConfig>,
}

impl Config {
    /// Parse configuration from a JSON string
    pub fn from_json_str(content: &str) -> AnyResult<Self> {
        let config: Self =
            serde_json::from_str(content).context("Failed to parse configuration JSON")?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> AnyResult<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;
        Self::from_json_str(&content)
            .with_context(|| format!("Invalid configuration in {:?}", path.as_ref()))
    }

    /// Structural validation. Registry-dependent checks (known task,
    /// guard and screen types) happen when flows are added to a workflow.
    pub fn validate(&self) -> AnyResult<()> {
        if self.product.name.trim().is_empty() {
            bail!("Product name must be specified");
        }

        let flows = self.all_flows();
        if flows.is_empty() {
            bail!("At least one flow must be defined");
        }

        for (flow_id, flow) in &flows {
            if flow.steps.is_empty() {
                bail!("Flow '{}' has no steps", flow_id);
            }

            let mut seen = HashSet::new();
            for step in &flow.steps {
                if step.id.trim().is_empty() {
                    bail!("Flow '{}' has a step without an id", flow_id);
                }
                if !seen.insert(step.id.as_str()) {
                    bail!("Flow '{}' has duplicate step id '{}'", flow_id, step.id);
                }
            }

            if let Some(entry) = flow.entry_step() {
                if !seen.contains(entry) {
                    bail!("Flow '{}' entry step '{}' does not exist", flow_id, entry);
                }
            }
        }

        Ok(())
    }

    /// Every flow, including a legacy `flow` registered as `install`
    /// when no explicit `install` flow exists
    pub fn all_flows(&self) -> BTreeMap<String, FlowConfig> {
        let mut flows = self.flows.clone();
        if let Some(flow) = &self.flow {
            flows
                .entry(LEGACY_FLOW_ID.to_string())
                .or_insert_with(|| flow.clone());
        }
        flows
    }

    /// Seed product information and metadata into a context
    pub fn apply_to_context(&self, ctx: &InstallContext) {
        ctx.set("product.name", self.product.name.clone());
        ctx.set("product.version", self.product.version.clone());
        ctx.set("product.logo", self.product.logo.clone());
        for (key, value) in &self.meta {
            ctx.set_meta(key, value.clone());
        }
    }
}

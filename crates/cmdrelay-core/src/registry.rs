//! The operation registry.
//!
//! The registry maps operation names to their command template and parameter
//! validators. It is assembled once at startup through a [`RegistryBuilder`]
//! (either programmatically or from a TOML file) and then frozen into an
//! [`OperationRegistry`], which has no mutating methods. Request handlers
//! share it through an `Arc` and read it without locking.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::error::{GatewayError, RegistryError};
use crate::executor::Invocation;
use crate::param::{DEFAULT_STRING_MAX_LEN, ParamDescription, ParamKind, ParamSpec, is_identifier};
use crate::template::CommandTemplate;

/// Longest accepted operation name.
const MAX_OPERATION_NAME_LEN: usize = 64;

/// Longest parameter name echoed back in an error.
const MAX_ECHOED_NAME_LEN: usize = 64;

/// Definition of an operation, as handed to [`RegistryBuilder::register`].
#[derive(Debug, Clone)]
pub struct OperationDef {
    pub name: String,
    pub description: String,
    /// Program followed by argument templates.
    pub command: Vec<String>,
    pub params: Vec<ParamSpec>,
    /// Overrides the gateway's default timeout.
    pub timeout: Option<Duration>,
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables for the child.
    pub env: BTreeMap<String, String>,
}

impl OperationDef {
    /// A definition from the three essentials: name, argv template, validators.
    #[must_use]
    pub fn new<S: Into<String>>(
        name: impl Into<String>,
        command: impl IntoIterator<Item = S>,
        params: Vec<ParamSpec>,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            command: command.into_iter().map(Into::into).collect(),
            params,
            timeout: None,
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// A registered, validated operation. Immutable.
#[derive(Debug)]
pub struct Operation {
    name: String,
    description: String,
    template: CommandTemplate,
    params: Vec<ParamSpec>,
    timeout: Option<Duration>,
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

impl Operation {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Per-operation timeout override, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Validate raw request parameters and build the argv.
    ///
    /// Unknown keys are rejected, `null` counts as "not supplied", defaults
    /// fill in omitted parameters, and a missing required parameter is an
    /// error. Nothing is spawned here.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidParameter`] on the first offending
    /// parameter.
    pub fn bind(&self, raw: &Map<String, Value>) -> Result<Invocation, GatewayError> {
        if let Some(unknown) = raw
            .keys()
            .find(|key| !self.params.iter().any(|p| &p.name == *key))
        {
            return Err(GatewayError::InvalidParameter {
                name: sanitize_name(unknown),
                reason: "unknown parameter".to_owned(),
            });
        }

        let mut values = HashMap::with_capacity(self.params.len());
        for spec in &self.params {
            match raw.get(&spec.name).filter(|v| !v.is_null()) {
                Some(value) => {
                    let validated = spec.kind.validate(value).map_err(|reason| {
                        GatewayError::InvalidParameter {
                            name: spec.name.clone(),
                            reason,
                        }
                    })?;
                    values.insert(spec.name.clone(), validated);
                }
                None => {
                    if let Some(default) = &spec.default {
                        values.insert(spec.name.clone(), default.clone());
                    } else if spec.required {
                        return Err(GatewayError::InvalidParameter {
                            name: spec.name.clone(),
                            reason: "missing required parameter".to_owned(),
                        });
                    }
                }
            }
        }

        Ok(Invocation {
            program: self.template.program().to_owned(),
            args: self.template.render_args(&values),
            working_dir: self.working_dir.clone(),
            env: self.env.clone(),
        })
    }

    /// Discovery view. The command template is not included.
    pub fn describe(&self) -> OperationDescription {
        OperationDescription {
            name: self.name.clone(),
            description: self.description.clone(),
            timeout_ms: self
                .timeout
                .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
            params: self.params.iter().map(ParamSpec::describe).collect(),
        }
    }
}

/// Serializable description of an operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationDescription {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub params: Vec<ParamDescription>,
}

/// Collects operation definitions during startup.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    operations: HashMap<String, Arc<Operation>>,
}

impl RegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and add an operation.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::DuplicateOperation`] if the name is taken.
    /// - [`RegistryError::InvalidOperation`] for a bad name, template,
    ///   parameter declaration, timeout, or environment key.
    /// - [`RegistryError::UndeclaredPlaceholder`] if the template uses an
    ///   undeclared parameter.
    /// - [`RegistryError::InvalidDefault`] if a default fails its validator.
    pub fn register(&mut self, def: OperationDef) -> Result<(), RegistryError> {
        let name = def.name;
        let invalid = |reason: String| RegistryError::InvalidOperation {
            name: name.clone(),
            reason,
        };

        validate_operation_name(&name).map_err(invalid)?;

        if self.operations.contains_key(&name) {
            return Err(RegistryError::DuplicateOperation { name });
        }

        let template = CommandTemplate::parse(&def.command).map_err(invalid)?;

        let mut declared = HashSet::new();
        for spec in &def.params {
            if !is_identifier(&spec.name) {
                return Err(invalid(format!("invalid parameter name '{}'", spec.name)));
            }
            if !declared.insert(spec.name.as_str()) {
                return Err(invalid(format!("parameter '{}' declared twice", spec.name)));
            }
            if let Some(default) = &spec.default {
                spec.kind
                    .validate(&default.to_json())
                    .map_err(|reason| RegistryError::InvalidDefault {
                        name: name.clone(),
                        param: spec.name.clone(),
                        reason,
                    })?;
            }
        }

        if let Some(placeholder) = template.placeholders().find(|p| !declared.contains(p)) {
            return Err(RegistryError::UndeclaredPlaceholder {
                name,
                placeholder: placeholder.to_owned(),
            });
        }

        if def.timeout == Some(Duration::ZERO) {
            return Err(invalid("timeout must be greater than 0".to_owned()));
        }

        if let Some(key) = def
            .env
            .keys()
            .find(|k| k.is_empty() || k.contains('=') || k.contains('\0'))
        {
            return Err(invalid(format!("invalid environment variable name '{key}'")));
        }

        let operation = Operation {
            name: name.clone(),
            description: def.description,
            template,
            params: def.params,
            timeout: def.timeout,
            working_dir: def.working_dir,
            env: def.env,
        };

        info!(operation = %name, program = %operation.template.program(), "operation registered");
        self.operations.insert(name, Arc::new(operation));
        Ok(())
    }

    /// Parse a TOML registry document and register every operation in it.
    ///
    /// `$VAR` and `${VAR:-default}` references in `command` elements, `env`
    /// values and `working_dir` are expanded from the process environment.
    /// References to unset variables without a default stay literal, so
    /// `sh -c 'echo $1'` survives. Nothing else in the document is expanded.
    /// `origin` is only used in error messages.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Parse`] for malformed documents, or any error
    /// from [`register`](Self::register).
    pub fn add_toml(&mut self, document: &str, origin: &str) -> Result<(), RegistryError> {
        let parse_err = |reason: String| RegistryError::Parse {
            path: origin.to_owned(),
            reason,
        };

        let file: RegistryFile = toml::from_str(document).map_err(|e| parse_err(e.to_string()))?;

        for op in file.operation {
            let def = op.into_def()?;
            self.register(def)?;
        }
        Ok(())
    }

    /// Freeze the registry.
    #[must_use]
    pub fn build(self) -> OperationRegistry {
        OperationRegistry {
            operations: self.operations,
        }
    }
}

/// The frozen, read-only operation registry.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    operations: HashMap<String, Arc<Operation>>,
}

impl OperationRegistry {
    /// Load a registry from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Load`] if the file cannot be read, or any
    /// error from [`RegistryBuilder::add_toml`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let origin = path.display().to_string();
        let document = std::fs::read_to_string(path).map_err(|e| RegistryError::Load {
            path: origin.clone(),
            reason: e.to_string(),
        })?;

        let mut builder = RegistryBuilder::new();
        builder.add_toml(&document, &origin)?;
        let registry = builder.build();
        info!(path = %origin, operations = registry.len(), "operation registry loaded");
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Operation>> {
        self.operations.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Describe every operation, sorted by name.
    pub fn describe(&self) -> Vec<OperationDescription> {
        let mut out: Vec<_> = self.operations.values().map(|op| op.describe()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

// ── Registry file schema ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegistryFile {
    #[serde(default)]
    operation: Vec<OperationFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OperationFile {
    name: String,
    #[serde(default)]
    description: String,
    command: Vec<String>,
    timeout_secs: Option<u64>,
    working_dir: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    param: Vec<ParamFile>,
}

/// One `[[operation.param]]` table. Every kind's settings live side by side
/// so unknown keys are caught; [`ParamFile::kind`] rejects the ones that do
/// not belong to the declared `type`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ParamFile {
    name: String,
    #[serde(rename = "type")]
    kind: KindTag,
    #[serde(default = "default_required")]
    required: bool,
    default: Option<Value>,
    pattern: Option<String>,
    max_len: Option<usize>,
    min: Option<i64>,
    max: Option<i64>,
    values: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum KindTag {
    String,
    Integer,
    Enum,
}

fn default_required() -> bool {
    true
}

impl KindTag {
    fn label(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Enum => "enum",
        }
    }
}

impl ParamFile {
    fn kind(&mut self) -> Result<ParamKind, String> {
        let settings = [
            ("pattern", self.pattern.is_some(), KindTag::String),
            ("max_len", self.max_len.is_some(), KindTag::String),
            ("min", self.min.is_some(), KindTag::Integer),
            ("max", self.max.is_some(), KindTag::Integer),
            ("values", self.values.is_some(), KindTag::Enum),
        ];
        if let Some((key, ..)) = settings
            .iter()
            .find(|(_, set, owner)| *set && *owner != self.kind)
        {
            return Err(format!(
                "'{key}' does not apply to {} parameters",
                self.kind.label()
            ));
        }

        match self.kind {
            KindTag::String => {
                let pattern = self
                    .pattern
                    .take()
                    .ok_or_else(|| "string parameters need a 'pattern'".to_owned())?;
                ParamKind::string(&pattern, self.max_len.unwrap_or(DEFAULT_STRING_MAX_LEN))
            }
            KindTag::Integer => ParamKind::integer(self.min, self.max),
            KindTag::Enum => {
                let values = self
                    .values
                    .take()
                    .ok_or_else(|| "enum parameters need 'values'".to_owned())?;
                ParamKind::one_of(values)
            }
        }
    }
}

/// Expand environment references in a command element, env value or
/// working directory. Unset variables without a default are left as written.
fn expand_env(raw: &str) -> String {
    shellexpand::env_with_context_no_errors(raw, |var| std::env::var(var).ok()).into_owned()
}

impl OperationFile {
    fn into_def(self) -> Result<OperationDef, RegistryError> {
        let mut params = Vec::with_capacity(self.param.len());
        for mut p in self.param {
            let kind = p.kind().map_err(|reason| RegistryError::InvalidOperation {
                name: self.name.clone(),
                reason: format!("parameter '{}': {reason}", p.name),
            })?;

            let default = match p.default {
                Some(raw) => Some(kind.validate(&raw).map_err(|reason| {
                    RegistryError::InvalidDefault {
                        name: self.name.clone(),
                        param: p.name.clone(),
                        reason,
                    }
                })?),
                None => None,
            };

            params.push(ParamSpec {
                name: p.name,
                kind,
                required: p.required,
                default,
            });
        }

        Ok(OperationDef {
            name: self.name,
            description: self.description,
            command: self.command.iter().map(|arg| expand_env(arg)).collect(),
            params,
            timeout: self.timeout_secs.map(Duration::from_secs),
            working_dir: self.working_dir.as_deref().map(|dir| PathBuf::from(expand_env(dir))),
            env: self
                .env
                .into_iter()
                .map(|(key, value)| (key, expand_env(&value)))
                .collect(),
        })
    }
}

fn validate_operation_name(name: &str) -> Result<(), String> {
    if name.is_empty() || name.len() > MAX_OPERATION_NAME_LEN {
        return Err(format!(
            "operation name must be 1 to {MAX_OPERATION_NAME_LEN} bytes"
        ));
    }
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
        return Err("operation name must match [A-Za-z0-9][A-Za-z0-9._-]*".to_owned());
    }
    Ok(())
}

/// Make a caller-supplied key safe to echo: escape control and quote
/// characters and cap the length.
pub(crate) fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .take(MAX_ECHOED_NAME_LEN)
        .flat_map(char::escape_debug)
        .collect()
}

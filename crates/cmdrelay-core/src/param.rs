//! Parameter declarations and validators.
//!
//! Every value supplied by a caller passes through [`ParamKind::validate`]
//! before it can reach a command template. A validated value is a
//! [`ParamValue`]; raw JSON never flows further than this module.

use std::fmt;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

/// Default `max_len` for string parameters when the registry omits it.
pub const DEFAULT_STRING_MAX_LEN: usize = 256;

/// The type and constraints of one declared parameter.
#[derive(Debug, Clone)]
pub enum ParamKind {
    /// A JSON string of bounded length matching an anchored pattern.
    String {
        /// Compiled pattern, anchored at both ends.
        pattern: Regex,
        /// The pattern as written in the registry (for discovery output).
        source: String,
        /// Maximum length in bytes.
        max_len: usize,
    },
    /// A JSON integer inside optional inclusive bounds.
    Integer { min: Option<i64>, max: Option<i64> },
    /// A JSON string equal to one of a fixed set of values.
    Enum { values: Vec<String> },
}

impl ParamKind {
    /// Build a string validator.
    ///
    /// The pattern is wrapped as `\A(?:pattern)\z`, so it always has to match
    /// the whole value even when the registry author forgot the anchors.
    ///
    /// # Errors
    ///
    /// Returns a reason string if the regex does not compile or `max_len` is 0.
    pub fn string(pattern: &str, max_len: usize) -> Result<Self, String> {
        if max_len == 0 {
            return Err("max_len must be greater than 0".to_owned());
        }
        let anchored = format!(r"\A(?:{pattern})\z");
        let compiled =
            Regex::new(&anchored).map_err(|e| format!("invalid pattern '{pattern}': {e}"))?;
        Ok(Self::String {
            pattern: compiled,
            source: pattern.to_owned(),
            max_len,
        })
    }

    /// Build an integer validator.
    ///
    /// # Errors
    ///
    /// Returns a reason string if `min > max`.
    pub fn integer(min: Option<i64>, max: Option<i64>) -> Result<Self, String> {
        if let (Some(lo), Some(hi)) = (min, max) {
            if lo > hi {
                return Err(format!("min ({lo}) cannot exceed max ({hi})"));
            }
        }
        Ok(Self::Integer { min, max })
    }

    /// Build an enum validator.
    ///
    /// # Errors
    ///
    /// Returns a reason string if `values` is empty.
    pub fn one_of(values: Vec<String>) -> Result<Self, String> {
        if values.is_empty() {
            return Err("enum must allow at least one value".to_owned());
        }
        Ok(Self::Enum { values })
    }

    /// Short type name used in discovery output.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String { .. } => "string",
            Self::Integer { .. } => "integer",
            Self::Enum { .. } => "enum",
        }
    }

    /// Validate a raw JSON value.
    ///
    /// The returned reason never contains the rejected value.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the value is rejected.
    pub fn validate(&self, value: &Value) -> Result<ParamValue, String> {
        match self {
            Self::String {
                pattern, max_len, ..
            } => {
                let Value::String(s) = value else {
                    return Err(format!("expected a string, got {}", json_type(value)));
                };
                if s.len() > *max_len {
                    return Err(format!("must be at most {max_len} bytes"));
                }
                if !pattern.is_match(s) {
                    return Err("does not match the required pattern".to_owned());
                }
                Ok(ParamValue::Text(s.clone()))
            }
            Self::Integer { min, max } => {
                let Some(n) = value.as_i64() else {
                    return Err(format!("expected an integer, got {}", json_type(value)));
                };
                if let Some(lo) = min {
                    if n < *lo {
                        return Err(format!("must be >= {lo}"));
                    }
                }
                if let Some(hi) = max {
                    if n > *hi {
                        return Err(format!("must be <= {hi}"));
                    }
                }
                Ok(ParamValue::Integer(n))
            }
            Self::Enum { values } => {
                let Value::String(s) = value else {
                    return Err(format!("expected a string, got {}", json_type(value)));
                };
                if values.iter().any(|v| v == s) {
                    Ok(ParamValue::Text(s.clone()))
                } else {
                    Err(format!("must be one of: {}", values.join(", ")))
                }
            }
        }
    }
}

/// A declared parameter of an operation.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    /// Parameter name, referenced as `{name}` in the command template.
    pub name: String,
    /// Type and constraints.
    pub kind: ParamKind,
    /// Whether the caller must supply a value (ignored when a default exists).
    pub required: bool,
    /// Value used when the caller omits the parameter. Already validated.
    pub default: Option<ParamValue>,
}

impl ParamSpec {
    /// A required parameter with no default.
    #[must_use]
    pub fn required(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            default: None,
        }
    }

    /// An optional parameter with no default.
    #[must_use]
    pub fn optional(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default: None,
        }
    }

    /// Attach a default value.
    #[must_use]
    pub fn with_default(mut self, value: ParamValue) -> Self {
        self.default = Some(value);
        self
    }

    /// Discovery view of this parameter.
    pub fn describe(&self) -> ParamDescription {
        let mut desc = ParamDescription {
            name: self.name.clone(),
            kind: self.kind.type_name(),
            required: self.required && self.default.is_none(),
            pattern: None,
            max_len: None,
            min: None,
            max: None,
            values: None,
            default: self.default.as_ref().map(ParamValue::to_json),
        };
        match &self.kind {
            ParamKind::String {
                source, max_len, ..
            } => {
                desc.pattern = Some(source.clone());
                desc.max_len = Some(*max_len);
            }
            ParamKind::Integer { min, max } => {
                desc.min = *min;
                desc.max = *max;
            }
            ParamKind::Enum { values } => desc.values = Some(values.clone()),
        }
        desc
    }
}

/// Serializable description of a parameter, without compiled state.
#[derive(Debug, Clone, Serialize)]
pub struct ParamDescription {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_len: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// A value that has passed validation and may be substituted into argv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Text(String),
    Integer(i64),
}

impl ParamValue {
    pub(crate) fn to_json(&self) -> Value {
        match self {
            Self::Text(s) => Value::String(s.clone()),
            Self::Integer(n) => Value::from(*n),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Integer(n) => write!(f, "{n}"),
        }
    }
}

/// Whether `name` is a valid parameter identifier: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

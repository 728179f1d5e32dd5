//! Error types for `cmdrelay-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. Parameter errors never include the rejected value, only the
//! parameter name and the rule it broke.
//!
//! Process outcomes (non-zero exit, timeout, launch failure) are not errors:
//! they are reported as data in [`ExecutionResult`](crate::result::ExecutionResult).

/// Errors raised while building the operation registry at startup.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// An operation with this name is already registered.
    #[error("duplicate operation: {name}")]
    DuplicateOperation { name: String },

    /// The operation definition is malformed.
    #[error("invalid operation '{name}': {reason}")]
    InvalidOperation { name: String, reason: String },

    /// The command template references a parameter that is not declared.
    #[error("operation '{name}' references undeclared parameter '{placeholder}'")]
    UndeclaredPlaceholder { name: String, placeholder: String },

    /// A parameter default does not pass its own validator.
    #[error("operation '{name}': default for parameter '{param}' is invalid: {reason}")]
    InvalidDefault {
        name: String,
        param: String,
        reason: String,
    },

    /// The registry file could not be read.
    #[error("failed to read registry '{path}': {reason}")]
    Load { path: String, reason: String },

    /// The registry file is not valid TOML or does not match the schema.
    #[error("failed to parse registry '{path}': {reason}")]
    Parse { path: String, reason: String },
}

/// Per-request errors from [`Gateway::handle_request`](crate::gateway::Gateway::handle_request).
///
/// These are raised before any process is spawned.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// No operation with this name is registered.
    #[error("unknown operation: {name}")]
    UnknownOperation { name: String },

    /// A supplied parameter failed validation, was missing, or was not declared.
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    /// The concurrency limit is exhausted.
    #[error("gateway overloaded: all {limit} execution slots are busy")]
    Overloaded { limit: usize },
}

impl GatewayError {
    /// Stable machine-readable kind, used in HTTP bodies and audit entries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownOperation { .. } => "unknown_operation",
            Self::InvalidParameter { .. } => "invalid_parameter",
            Self::Overloaded { .. } => "overloaded",
        }
    }
}

/// Errors from audit sinks.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// The sink failed to persist an entry.
    #[error("audit sink '{name}' failed: {reason}")]
    SinkFailure { name: String, reason: String },

    /// The entry could not be serialized.
    #[error("audit serialization failed: {reason}")]
    Serialization { reason: String },
}

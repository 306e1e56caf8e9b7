//! Domain error type for the dataplane agent.
//!
//! A structured, categorisable `thiserror` enum naming the error kinds this
//! agent actually produces: transient store failures, data inconsistency,
//! record validation, dataplane commit failures and rule compilation
//! failures, rather than generic filesystem/network/security errors.

use thiserror::Error;

/// Result type alias for felix-agent domain operations.
pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Error, Debug, Clone)]
pub enum AgentError {
    /// Store read/poll timed out or the connection reset; the caller should
    /// reconnect and retry without changing any in-memory state.
    #[error("store operation '{operation}' failed transiently: {reason}")]
    StoreTransient { operation: String, reason: String },

    /// The store's data is inconsistent with what polling assumed (cluster
    /// id changed, a resync-critical prefix was deleted wholesale, the
    /// ready flag vanished). The caller must abort the current poll and
    /// re-enter SNAPSHOT.
    #[error("store data inconsistency: {reason}")]
    DataInconsistency { reason: String },

    /// A single record failed validation; treated as a deletion of that
    /// record by the caller, logged once at warning level.
    #[error("invalid record at '{key}': {reason}")]
    InvalidRecord { key: String, reason: String },

    /// Dataplane tool invocation or its restore script failed to commit.
    #[error("dataplane commit failed for {tool} ({family}): {reason}")]
    DataplaneCommit {
        tool: String,
        family: String,
        reason: String,
    },

    /// A single rule could not be compiled (e.g. `icmp_type: 255`); the
    /// caller substitutes a commented drop fragment and continues.
    #[error("rule compilation failed: {reason}")]
    RuleCompilation { reason: String },

    /// Configuration drifted from the first successfully loaded value;
    /// the caller should trigger a supervised process exit.
    #[error("configuration drift detected: {reason}")]
    ConfigDrift { reason: String },

    /// A required configuration key was missing or malformed at startup.
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    /// The referenced object could not be found or created by the
    /// reference manager.
    #[error("reference manager error for '{id}': {reason}")]
    Reference { id: String, reason: String },
}

impl AgentError {
    pub fn store_transient(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StoreTransient {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn data_inconsistency(reason: impl Into<String>) -> Self {
        Self::DataInconsistency {
            reason: reason.into(),
        }
    }

    pub fn invalid_record(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn dataplane_commit(
        tool: impl Into<String>,
        family: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::DataplaneCommit {
            tool: tool.into(),
            family: family.into(),
            reason: reason.into(),
        }
    }

    pub fn rule_compilation(reason: impl Into<String>) -> Self {
        Self::RuleCompilation {
            reason: reason.into(),
        }
    }

    pub fn config_drift(reason: impl Into<String>) -> Self {
        Self::ConfigDrift {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn reference(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Reference {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Whether a caller should reconnect and retry without otherwise
    /// changing state (§7: "Transient store error").
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::StoreTransient { .. })
    }

    /// Whether a caller should abort the current poll and re-enter
    /// SNAPSHOT (§7: "Data inconsistency").
    pub fn requires_resync(&self) -> bool {
        matches!(self, AgentError::DataInconsistency { .. })
    }

    pub fn category(&self) -> &'static str {
        match self {
            AgentError::StoreTransient { .. } => "store_transient",
            AgentError::DataInconsistency { .. } => "data_inconsistency",
            AgentError::InvalidRecord { .. } => "invalid_record",
            AgentError::DataplaneCommit { .. } => "dataplane_commit",
            AgentError::RuleCompilation { .. } => "rule_compilation",
            AgentError::ConfigDrift { .. } => "config_drift",
            AgentError::Configuration { .. } => "configuration",
            AgentError::Reference { .. } => "reference",
        }
    }
}

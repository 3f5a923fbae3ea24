//! Error types for contract testing
//!
//! Two families live here. Harness failures (build, startup, fixtures, setup,
//! connectivity) mean the test environment is broken. Contract violations mean
//! the API answered, but not with anything the suite accepts.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Build failed: {0}")]
    Build(String),

    #[error("Server failed to start: {0}")]
    ServerStartup(String),

    #[error("Server not accepting connections on {addr} after {attempts} attempts")]
    ServerHealthCheck { addr: String, attempts: usize },

    #[error("Cannot reach {url}: {reason}")]
    Connectivity { url: String, reason: String },

    #[error("Fixture '{fixture}' failed: {reason}")]
    Fixture { fixture: String, reason: String },

    #[error("Setup step failed: {0}")]
    Setup(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Test spec parse error: {0}")]
    SpecParse(String),

    #[error("Unknown variable: ${{{0}}}")]
    UnknownVariable(String),

    #[error("{scenario}: expected status in {expected}, got {actual} (body: {body})")]
    ContractViolation {
        scenario: String,
        expected: String,
        actual: u16,
        body: String,
    },

    #[error("{scenario}: {reason}")]
    CheckFailed { scenario: String, reason: String },

    #[error("Interrupted")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl E2eError {
    /// True when the API answered but broke the declared contract.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            E2eError::ContractViolation { .. } | E2eError::CheckFailed { .. }
        )
    }

    /// True when the session cannot continue at all.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            E2eError::Build(_)
                | E2eError::ServerStartup(_)
                | E2eError::ServerHealthCheck { .. }
                | E2eError::Config(_)
                | E2eError::SpecParse(_)
                | E2eError::Interrupted
        )
    }
}

pub type E2eResult<T> = Result<T, E2eError>;

use std::io;

use thiserror::Error;

/// Configuration problems. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error("failed to fetch config {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("unsupported config scheme {0}")]
    UnsupportedScheme(String),

    #[error("environment variable {0} is not defined")]
    MissingEnv(String),

    #[error("failed to parse config: {0}")]
    Yaml(#[from] yaml_rust::ScanError),

    #[error("invalid config: {0}")]
    Structure(String),

    #[error("unknown config section [plugin.{0}]")]
    UnknownSection(String),

    #[error("[{plugin}] {field} required")]
    MissingField { plugin: String, field: &'static str },

    #[error("[{plugin}] invalid {field}: {reason}")]
    InvalidField {
        plugin: String,
        field: &'static str,
        reason: String,
    },

    #[error("invalid dimension: {0}")]
    InvalidDimension(String),

    #[error("invalid duration: {0}")]
    InvalidDuration(String),

    #[error("destination {0} is not allowed. use cloudwatch or mackerel")]
    UnknownDestination(String),

    #[error(transparent)]
    Credentials(#[from] CredentialsError),
}

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("AWS_REGION is not set")]
    MissingRegion,

    #[error("AWS credentials are not set: {0} is missing")]
    MissingKey(&'static str),
}

/// Request signing failures.
#[derive(Debug, Error)]
pub enum SignError {
    #[error("invalid signing key length")]
    InvalidKeyLength,
}

/// Failures of one outbound backend call. Logged and dropped by the dispatcher.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("{service} returned status {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("{service} request failed: {reason}")]
    Transport {
        service: &'static str,
        reason: String,
    },

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Sign(#[from] SignError),

    #[error("failed to write payload: {0}")]
    Io(#[from] io::Error),
}

/// Process-level failures escalated out of the agent.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to initialize {backend} client: {reason}")]
    Backend {
        backend: &'static str,
        reason: String,
    },

    #[error("failed to spawn thread {name}: {source}")]
    Spawn { name: String, source: io::Error },
}

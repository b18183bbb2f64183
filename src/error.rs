//! Error types for the relay.

use std::path::PathBuf;
use std::time::Duration;

/// Startup configuration errors. All of these are fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Master secret could not be decoded: {0}")]
    UndecodableSecret(String),

    #[error("Master secret too short: {actual} bytes, need at least {min}")]
    SecretTooShort { actual: usize, min: usize },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Alias directory loading errors.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("Alias file {0} is missing")]
    Missing(PathBuf),

    #[error("Alias file {path} could not be read: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Alias file is not a JSON object of alias to address: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Alias directory is empty")]
    Empty,

    #[error("Invalid alias {alias:?}: {reason}")]
    InvalidAlias { alias: String, reason: String },

    #[error("Invalid owner address for alias {alias:?}")]
    InvalidOwner { alias: String },

    #[error("Duplicate alias {0:?}")]
    DuplicateAlias(String),
}

/// Address wrapping/unwrapping failures. Always recoverable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("address does not match the email grammar")]
    InvalidGrammar,

    #[error("address is not under the mailer domain")]
    ForeignDomain,

    #[error("address under the mailer domain is not a known alias")]
    UnknownAlias,

    #[error("address does not carry a wrapped address")]
    NotWrapped,

    #[error("decoded domain contains an underscore")]
    NestedDomain,

    #[error("forward address carries no alias suffix")]
    MissingAlias,
}

/// Message-ID cipher failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    #[error("token is not a wrapped message id")]
    Malformed,

    #[error("token was minted for another domain")]
    ForeignDomain,

    #[error("token payload is too short")]
    Truncated,

    #[error("token failed authentication")]
    Integrity,

    #[error("token is bound to a different sender")]
    SenderMismatch,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("encryption failed")]
    Encryption,
}

/// Request-level routing failures. Each one aborts the whole request.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("sender cannot be wrapped: {0}")]
    HardWrap(AddressError),

    #[error("In-Reply-To could not be verified: {0}")]
    ThreadToken(CipherError),

    #[error("Message-Id could not be encoded: {0}")]
    MessageIdEncode(CipherError),
}

/// Webhook body failures. All of these answer like an unknown route.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("unsupported content type {0:?}")]
    UnsupportedContentType(String),

    #[error("malformed form body: {0}")]
    Malformed(String),

    #[error("missing required field {0}")]
    MissingField(&'static str),

    #[error("signature fields did not verify")]
    Unauthenticated,

    #[error("more than {max} attachments")]
    TooManyAttachments { max: usize },

    #[error("attachments exceed {max} bytes")]
    AttachmentsTooLarge { max: usize },

    #[error("attachment could not be spooled: {0}")]
    Spool(#[from] std::io::Error),
}

/// Outbound delivery errors. Logged only, never surfaced to the webhook caller.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Invalid send job: {0}")]
    InvalidJob(String),

    #[error("Provider {provider} rejected the message with {status}: {body}")]
    Rejected {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Provider {provider} request failed: {reason}")]
    Transport { provider: String, reason: String },

    #[error("Attachment {filename} could not be read: {reason}")]
    Attachment { filename: String, reason: String },

    #[error("Dispatch queue is full ({capacity} jobs)")]
    QueueFull { capacity: usize },

    #[error("Dispatch queue is closed")]
    QueueClosed,

    #[error("Giving up after {attempts} attempts over {elapsed:?}: {last}")]
    Exhausted {
        attempts: u32,
        elapsed: Duration,
        last: String,
    },
}

impl DeliveryError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Transport { .. } => true,
            DeliveryError::Rejected { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

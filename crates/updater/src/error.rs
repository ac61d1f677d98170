use serde::Serialize;
use std::time::Duration;

/// Convenient result alias for updater operations.
pub type Result<T> = std::result::Result<T, UpdaterError>;

/// Errors that can terminate an update attempt.
#[derive(thiserror::Error, Debug)]
pub enum UpdaterError {
    /// HTTP request to the builds server failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Transport-level failure that is not a reqwest error (bad status, truncated body, ...).
    #[error("network error: {0}")]
    Network(String),
    /// A network operation exceeded its deadline.
    #[error("network operation timed out after {0:?}")]
    Timeout(Duration),
    /// Writing the staged artifact failed.
    #[error("staging file operation failed: {0}")]
    Disk(#[from] std::io::Error),
    /// The detached signature blob could not be decoded.
    #[error("malformed detached signature: {0}")]
    SignatureParse(String),
    /// The signature did not validate against the artifact and the pinned key.
    #[error("signature invalid: {0}")]
    SignatureInvalid(String),
    /// The signature is valid but was produced by a key outside the allow-list.
    #[error("signature not made by an allowed signer (got {fingerprint})")]
    WrongSigner {
        /// Key id of the key that produced the signature.
        fingerprint: String,
    },
    /// The verified installer could not be started.
    #[error("failed to launch installer: {0}")]
    Launch(#[source] std::io::Error),
    /// Updates are administratively disabled or the host runs in safe mode.
    #[error("update not allowed: {0}")]
    NotEligible(&'static str),
    /// The update request itself is unusable (e.g. a malformed version id).
    #[error("invalid update request: {0}")]
    InvalidRequest(String),
    /// Another update attempt already owns the staging slot.
    #[error("an update attempt is already in progress")]
    AttemptInProgress,
    /// The host abandoned the attempt.
    #[error("update attempt cancelled")]
    Cancelled,
    /// The embedded trust anchor could not be loaded.
    #[error("trust anchor unusable: {0}")]
    TrustAnchor(String),
    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),
    /// Generic error.
    #[error("{0}")]
    Other(String),
}

/// Coarse classification of [`UpdaterError`] surfaced to the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection, HTTP status, truncated body or deadline failures.
    Network,
    /// The staging slot could not be written.
    Disk,
    /// The detached signature is not a readable OpenPGP signature.
    SignatureParse,
    /// No pinned key validates the signature over the downloaded bytes.
    SignatureInvalid,
    /// A pinned key validates the signature but may not sign releases.
    WrongSigner,
    /// The verified installer could not be started.
    Launch,
    /// The request was refused before any download started.
    Rejected,
    /// The host cancelled the attempt.
    Cancelled,
    /// Configuration, trust anchor or state machine failure.
    Internal,
}

impl ErrorKind {
    /// "Try again later" failures: nothing about the build itself is suspect.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Disk)
    }

    /// "Do not trust this build" failures.
    pub fn is_untrusted(self) -> bool {
        matches!(
            self,
            ErrorKind::SignatureParse | ErrorKind::SignatureInvalid | ErrorKind::WrongSigner
        )
    }
}

impl UpdaterError {
    /// Classify the error for the event stream.
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpdaterError::Http(_) | UpdaterError::Network(_) | UpdaterError::Timeout(_) => {
                ErrorKind::Network
            }
            UpdaterError::Disk(_) => ErrorKind::Disk,
            UpdaterError::SignatureParse(_) => ErrorKind::SignatureParse,
            UpdaterError::SignatureInvalid(_) => ErrorKind::SignatureInvalid,
            UpdaterError::WrongSigner { .. } => ErrorKind::WrongSigner,
            UpdaterError::Launch(_) => ErrorKind::Launch,
            UpdaterError::NotEligible(_)
            | UpdaterError::InvalidRequest(_)
            | UpdaterError::AttemptInProgress => ErrorKind::Rejected,
            UpdaterError::Cancelled => ErrorKind::Cancelled,
            UpdaterError::TrustAnchor(_) | UpdaterError::Config(_) | UpdaterError::Other(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Helper for wrapping transport failures that carry no reqwest error.
    pub fn network(msg: impl Into<String>) -> Self {
        UpdaterError::Network(msg.into())
    }
}

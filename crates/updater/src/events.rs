//! Lifecycle events delivered to the UI layer, in emission order.

use crate::download::DownloadProgress;
use crate::error::{ErrorKind, UpdaterError};
use serde::Serialize;
use tokio::sync::mpsc;

/// Per attempt: any number of `Progress`, then `Verifying` once the artifact
/// is staged, then exactly one of `Complete` or `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UpdateEvent {
    /// Bytes of the installer written to the staging slot so far.
    Progress {
        /// Running total; never decreases within an attempt.
        bytes_received: u64,
        /// `None` when the server declared no length.
        bytes_total: Option<u64>,
    },
    /// The installer is staged and its signature is being checked.
    Verifying {},
    /// The verified installer was started.
    Complete {},
    /// The attempt ended without launching anything.
    Error {
        /// Failure class.
        kind: ErrorKind,
        /// Same as `kind.is_retryable()`.
        retryable: bool,
        /// Human-readable detail.
        message: String,
    },
}

impl UpdateEvent {
    /// `Complete` or `Error`: the last event of an attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UpdateEvent::Complete {} | UpdateEvent::Error { .. })
    }
}

impl From<DownloadProgress> for UpdateEvent {
    fn from(progress: DownloadProgress) -> Self {
        UpdateEvent::Progress {
            bytes_received: progress.bytes_received,
            bytes_total: progress.bytes_total,
        }
    }
}

impl From<&UpdaterError> for UpdateEvent {
    fn from(err: &UpdaterError) -> Self {
        let kind = err.kind();
        UpdateEvent::Error {
            kind,
            retryable: kind.is_retryable(),
            message: err.to_string(),
        }
    }
}

/// Sending half handed to the controller. Cloning shares the same consumer.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<UpdateEvent>>,
}

impl EventSink {
    /// A sink paired with its single consumer.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UpdateEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops every event.
    pub fn disconnected() -> Self {
        Self { tx: None }
    }

    /// Deliver `event`; a vanished consumer is not an error.
    pub fn emit(&self, event: UpdateEvent) {
        let Some(tx) = &self.tx else { return };
        if tx.send(event).is_err() {
            tracing::trace!("event consumer gone, dropping update event");
        }
    }
}

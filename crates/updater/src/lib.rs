//! Signed installer updates with a verification gate in front of launch.
//!
//! The pipeline streams an installer from the builds server into a staging
//! slot, fetches its detached OpenPGP signature, verifies it against a pinned
//! publisher certificate, and only then hands the file to the operating
//! system. Progress and the final outcome are reported as [`UpdateEvent`]s.
//!
//! ```ignore
//! use signed_updater::{EventSink, UpdateController, UpdateRequest, UpdaterConfig};
//!
//! # async fn demo() -> signed_updater::Result<()> {
//! let config = UpdaterConfig::new("https://builds.example.com/desktop/".parse().unwrap());
//! let (events, mut rx) = EventSink::channel();
//! let controller = UpdateController::builder(config).events(events).build()?;
//!
//! tokio::spawn(async move {
//!     while let Some(event) = rx.recv().await {
//!         println!("{}", serde_json::to_string(&event).unwrap());
//!     }
//! });
//!
//! let outcome = controller.request_update(UpdateRequest::new("1.4.2")).await?;
//! println!("installer started from {}", outcome.installer_path.display());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod config;
mod download;
mod error;
mod events;
mod fetcher;
mod launcher;
mod signature;
mod trust;
mod updater;
mod verifier;

pub use config::UpdaterConfig;
pub use download::{discard_stale, DownloadProgress, DownloadSession, DownloadStatus, Downloader};
pub use error::{ErrorKind, Result, UpdaterError};
pub use events::{EventSink, UpdateEvent};
pub use fetcher::{
    artifact_url, signature_url, ArtifactSource, ArtifactStream, HttpSource, HttpSourceBuilder,
};
pub use launcher::{Launcher, ProcessLauncher, VerifiedInstaller, INSTALLER_ARGS};
pub use signature::DetachedSignature;
pub use trust::{Fingerprint, TrustAnchor, PUBLISHER_FINGERPRINT, PUBLISHER_KEY_ARMORED};
pub use updater::{
    UpdateController, UpdateControllerBuilder, UpdateEligibility, UpdateOutcome, UpdatePhase,
    UpdateRequest, MAX_SIGNATURE_LEN,
};
pub use verifier::{verify, FailureReason, VerificationVerdict};

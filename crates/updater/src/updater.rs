use crate::{
    config::UpdaterConfig,
    download::{discard_stale, DownloadSession, Downloader},
    error::{ErrorKind, Result, UpdaterError},
    events::{EventSink, UpdateEvent},
    fetcher::{artifact_url, signature_url, ArtifactSource, HttpSource},
    launcher::{Launcher, ProcessLauncher},
    trust::TrustAnchor,
    verifier::{verify, VerificationVerdict},
};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Upper bound on a detached signature download.
pub const MAX_SIGNATURE_LEN: usize = 4096;

const MAX_VERSION_ID_LEN: usize = 128;

/// Request to move to `version_id`, consumed by one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    version_id: String,
}

impl UpdateRequest {
    /// Request the build published under `version_id`.
    pub fn new(version_id: impl Into<String>) -> Self {
        Self {
            version_id: version_id.into(),
        }
    }

    /// Version directory on the builds server.
    pub fn version_id(&self) -> &str {
        &self.version_id
    }

    /// The version id becomes a URL path segment, so it must be a plain token.
    fn validate(&self) -> Result<()> {
        let id = self.version_id.as_str();
        let well_formed = !id.is_empty()
            && id.len() <= MAX_VERSION_ID_LEN
            && id != "."
            && id != ".."
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+'));
        if well_formed {
            Ok(())
        } else {
            Err(UpdaterError::InvalidRequest(format!(
                "malformed version id {id:?}"
            )))
        }
    }
}

/// Host-supplied preconditions for updating at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateEligibility {
    /// False when the user or an administrator switched auto-update off.
    pub updates_enabled: bool,
    /// True when the host runs in a degraded/safe mode.
    pub safe_mode: bool,
}

impl Default for UpdateEligibility {
    fn default() -> Self {
        Self {
            updates_enabled: true,
            safe_mode: false,
        }
    }
}

impl UpdateEligibility {
    fn check(&self) -> Result<()> {
        if !self.updates_enabled {
            return Err(UpdaterError::NotEligible("updates are disabled"));
        }
        if self.safe_mode {
            return Err(UpdaterError::NotEligible("running in safe mode"));
        }
        Ok(())
    }
}

/// Where the controller is in the current attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    /// No attempt has claimed the staging slot.
    Idle,
    /// Streaming the installer into the staging slot.
    Downloading,
    /// Installer staged; fetching `<artifact>.sig`.
    FetchingSignature,
    /// Checking the staged bytes against the pinned certificate.
    Verifying,
    /// Verified; handing the installer to the operating system.
    Launching,
    /// The installer was started.
    Done,
    /// The attempt ended without launching anything.
    Failed(ErrorKind),
}

impl UpdatePhase {
    /// True while an attempt owns the staging slot.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            UpdatePhase::Downloading
                | UpdatePhase::FetchingSignature
                | UpdatePhase::Verifying
                | UpdatePhase::Launching
        )
    }

    /// True once an attempt has ended, either way.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UpdatePhase::Done | UpdatePhase::Failed(_))
    }

    /// Legal edges of the attempt state machine.
    pub fn can_advance_to(&self, next: &UpdatePhase) -> bool {
        use UpdatePhase::*;
        match (self, next) {
            (Idle, Downloading)
            | (Downloading, FetchingSignature)
            | (FetchingSignature, Verifying)
            | (Verifying, Launching)
            | (Launching, Done) => true,
            (from, Failed(_)) => from.is_in_flight(),
            (from, Idle) => from.is_terminal(),
            _ => false,
        }
    }
}

/// Everything one attempt accumulates. Lives only inside the controller.
#[derive(Debug)]
struct UpdateAttempt {
    request: UpdateRequest,
    session: Option<DownloadSession>,
    signature: Option<Vec<u8>>,
    verdict: Option<VerificationVerdict>,
}

impl UpdateAttempt {
    fn new(request: UpdateRequest) -> Self {
        Self {
            request,
            session: None,
            signature: None,
            verdict: None,
        }
    }
}

/// Result of a successful attempt: the installer is running.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateOutcome {
    /// Version that was installed.
    pub version_id: String,
    /// Staging slot the installer was started from.
    pub installer_path: PathBuf,
    /// Key id of the key that signed the installer.
    pub signer_fingerprint: String,
    /// Size of the downloaded installer.
    pub bytes_received: u64,
}

/// Builder for [`UpdateController`].
pub struct UpdateControllerBuilder {
    config: UpdaterConfig,
    source: Option<Arc<dyn ArtifactSource>>,
    anchor: Option<Arc<TrustAnchor>>,
    launcher: Option<Arc<dyn Launcher>>,
    events: EventSink,
    eligibility: UpdateEligibility,
    cancel: CancellationToken,
}

impl UpdateControllerBuilder {
    fn new(config: UpdaterConfig) -> Self {
        Self {
            config,
            source: None,
            anchor: None,
            launcher: None,
            events: EventSink::disconnected(),
            eligibility: UpdateEligibility::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the HTTP client used for the builds server.
    pub fn source(mut self, source: Arc<dyn ArtifactSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Replace the embedded trust anchor.
    pub fn trust_anchor(mut self, anchor: Arc<TrustAnchor>) -> Self {
        self.anchor = Some(anchor);
        self
    }

    /// Replace the process launcher.
    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Where progress and terminal events go. Defaults to nowhere.
    pub fn events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Auto-update and safe-mode flags checked before every attempt.
    pub fn eligibility(mut self, eligibility: UpdateEligibility) -> Self {
        self.eligibility = eligibility;
        self
    }

    /// Token for the first attempt. Once cancelled, the next attempt gets a
    /// fresh one from the controller.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Build the controller and clear whatever a previous process left in the staging slot.
    pub fn build(self) -> Result<UpdateController> {
        self.config.validate()?;

        let source = match self.source {
            Some(source) => source,
            None => Arc::new(
                HttpSource::builder()
                    .connect_timeout(self.config.connect_timeout)
                    .build()?,
            ),
        };
        let anchor = match self.anchor {
            Some(anchor) => anchor,
            None => TrustAnchor::embedded()?,
        };
        let launcher = self
            .launcher
            .unwrap_or_else(|| Arc::new(ProcessLauncher));

        let staging_path = self.config.resolved_staging_path();
        discard_stale(&staging_path);

        let downloader = Downloader::new(
            Arc::clone(&source),
            self.config.download_timeout,
            self.config.stall_timeout,
        );

        Ok(UpdateController {
            config: self.config,
            staging_path,
            source,
            downloader,
            anchor,
            launcher,
            events: self.events,
            eligibility: self.eligibility,
            cancel: Mutex::new(self.cancel),
            phase: Mutex::new(UpdatePhase::Idle),
        })
    }
}

/// Drives download, signature fetch, verification and launch for one request at a time.
pub struct UpdateController {
    config: UpdaterConfig,
    staging_path: PathBuf,
    source: Arc<dyn ArtifactSource>,
    downloader: Downloader,
    anchor: Arc<TrustAnchor>,
    launcher: Arc<dyn Launcher>,
    events: EventSink,
    eligibility: UpdateEligibility,
    cancel: Mutex<CancellationToken>,
    phase: Mutex<UpdatePhase>,
}

impl UpdateController {
    /// Start configuring a controller.
    pub fn builder(config: UpdaterConfig) -> UpdateControllerBuilder {
        UpdateControllerBuilder::new(config)
    }

    /// Current phase of the latest attempt.
    pub fn phase(&self) -> UpdatePhase {
        *self.phase.lock()
    }

    /// Slot the installer is staged in.
    pub fn staging_path(&self) -> &Path {
        &self.staging_path
    }

    /// Token that cancels the current or next attempt.
    ///
    /// A cancelled token is replaced when the next attempt starts, so a host
    /// that cancelled must fetch the token again to cancel later attempts.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Run one update attempt to completion.
    ///
    /// On success the installer has been spawned and the host should exit.
    pub async fn request_update(&self, request: UpdateRequest) -> Result<UpdateOutcome> {
        let cancel = self.begin(&request)?;
        tracing::info!(version = %request.version_id(), "update attempt started");

        let mut attempt = UpdateAttempt::new(request);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UpdaterError::Cancelled),
            result = self.run(&mut attempt) => result,
        };

        let result = result.and_then(|outcome| self.advance(UpdatePhase::Done).map(|()| outcome));
        match result {
            Ok(outcome) => {
                self.events.emit(UpdateEvent::Complete {});
                tracing::info!(
                    version = %outcome.version_id,
                    signer = %outcome.signer_fingerprint,
                    "update handed to installer"
                );
                Ok(outcome)
            }
            Err(err) => {
                self.fail(&attempt, &err);
                Err(err)
            }
        }
    }

    /// Claim the staging slot, or reject the request without leaving `Idle`.
    /// Returns the token that cancels this attempt.
    fn begin(&self, request: &UpdateRequest) -> Result<CancellationToken> {
        let mut phase = self.phase.lock();
        if phase.is_in_flight() {
            tracing::warn!(
                version = %request.version_id(),
                phase = ?*phase,
                "update request ignored, attempt already in flight"
            );
            return Err(UpdaterError::AttemptInProgress);
        }
        if phase.is_terminal() {
            *phase = UpdatePhase::Idle;
        }

        if let Err(err) = self.eligibility.check().and_then(|()| request.validate()) {
            tracing::warn!(version = %request.version_id(), error = %err, "update request rejected");
            self.events.emit(UpdateEvent::from(&err));
            return Err(err);
        }

        let mut cancel = self.cancel.lock();
        if cancel.is_cancelled() {
            *cancel = CancellationToken::new();
        }

        *phase = UpdatePhase::Downloading;
        Ok(cancel.clone())
    }

    async fn run(&self, attempt: &mut UpdateAttempt) -> Result<UpdateOutcome> {
        let artifact = artifact_url(
            &self.config.builds_base,
            attempt.request.version_id(),
            &self.config.artifact_name,
        )?;

        let events = self.events.clone();
        let session = self
            .downloader
            .download(&artifact, &self.staging_path, move |progress| {
                events.emit(progress.into())
            })
            .await?;
        let bytes_received = session.bytes_received();
        attempt.session = Some(session);
        self.events.emit(UpdateEvent::Verifying {});

        self.advance(UpdatePhase::FetchingSignature)?;
        let sig_url = signature_url(&artifact);
        let signature = timeout(
            self.config.signature_timeout,
            self.source.fetch_bytes(&sig_url, MAX_SIGNATURE_LEN),
        )
        .await
        .map_err(|_| UpdaterError::Timeout(self.config.signature_timeout))??;
        attempt.signature = Some(signature.clone());

        self.advance(UpdatePhase::Verifying)?;
        let verdict = self.verify_staged(signature).await?;
        attempt.verdict = Some(verdict.clone());
        let installer = verdict.authorize(&self.anchor, self.staging_path.clone())?;

        self.advance(UpdatePhase::Launching)?;
        self.launcher.launch(&installer)?;

        Ok(UpdateOutcome {
            version_id: attempt.request.version_id().to_string(),
            installer_path: installer.path().to_path_buf(),
            signer_fingerprint: installer.signer().to_string(),
            bytes_received,
        })
    }

    /// Read the staged file and verify it off the async workers.
    async fn verify_staged(&self, signature: Vec<u8>) -> Result<VerificationVerdict> {
        let anchor = Arc::clone(&self.anchor);
        let path = self.staging_path.clone();
        let verdict = task::spawn_blocking(move || -> Result<VerificationVerdict> {
            let message = std::fs::read(&path)?;
            tracing::debug!(
                bytes = message.len(),
                sha256 = %hex::encode(Sha256::digest(&message)),
                "verifying staged installer"
            );
            Ok(verify(&message, &signature, &anchor))
        })
        .await
        .map_err(|err| UpdaterError::Other(format!("verification task failed: {err}")))??;

        tracing::info!(
            verified = verdict.verified,
            signer = ?verdict.signer_fingerprint,
            reason = ?verdict.reason,
            "signature verdict"
        );
        Ok(verdict)
    }

    fn fail(&self, attempt: &UpdateAttempt, err: &UpdaterError) {
        discard_stale(&self.staging_path);
        if let Err(illegal) = self.advance(UpdatePhase::Failed(err.kind())) {
            tracing::error!(error = %illegal, "could not record failed attempt");
        }
        tracing::warn!(
            version = %attempt.request.version_id(),
            received = attempt.session.as_ref().map(DownloadSession::bytes_received),
            had_signature = attempt.signature.is_some(),
            verdict = ?attempt.verdict.as_ref().map(|v| v.verified),
            error = %err,
            "update attempt failed, staged artifact discarded"
        );
        self.events.emit(UpdateEvent::from(err));
    }

    fn advance(&self, next: UpdatePhase) -> Result<()> {
        let mut phase = self.phase.lock();
        if !phase.can_advance_to(&next) {
            return Err(UpdaterError::Other(format!(
                "illegal update transition {:?} -> {next:?}",
                *phase
            )));
        }
        tracing::info!(from = ?*phase, to = ?next, "update phase");
        *phase = next;
        Ok(())
    }
}

//! Streaming artifact download into the staging slot.
//!
//! Bytes go to a temporary sibling of the staging path and are only renamed
//! onto it once the whole body arrived and hit the disk. A failed or dropped
//! download removes the temporary file, so the staging path never holds a
//! partial artifact.

use crate::error::{Result, UpdaterError};
use crate::fetcher::ArtifactSource;
use futures::StreamExt;
use reqwest::Url;
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{NamedTempFile, PathPersistError};
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout, Instant};

const PARTIAL_SUFFIX: &str = ".partial";

/// Byte counters reported after every received chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DownloadProgress {
    /// Bytes written so far; never decreases.
    pub bytes_received: u64,
    /// `None` when the server did not declare a length.
    pub bytes_total: Option<u64>,
}

/// Lifecycle of a [`DownloadSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    /// Chunks are still arriving.
    InProgress,
    /// The body was persisted at the staging path.
    Complete,
    /// Aborted; nothing is left at the staging path.
    Failed,
}

/// State of one download into the staging slot.
#[derive(Debug, Clone)]
pub struct DownloadSession {
    staging_path: PathBuf,
    bytes_received: u64,
    bytes_total: Option<u64>,
    status: DownloadStatus,
}

impl DownloadSession {
    fn new(staging_path: PathBuf) -> Self {
        Self {
            staging_path,
            bytes_received: 0,
            bytes_total: None,
            status: DownloadStatus::InProgress,
        }
    }

    fn record(&mut self, chunk_len: usize) -> DownloadProgress {
        self.bytes_received += chunk_len as u64;
        self.progress()
    }

    /// Counters as last reported.
    pub fn progress(&self) -> DownloadProgress {
        DownloadProgress {
            bytes_received: self.bytes_received,
            bytes_total: self.bytes_total,
        }
    }

    /// Where the artifact lands once complete.
    pub fn staging_path(&self) -> &Path {
        &self.staging_path
    }

    /// Bytes written so far.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Length declared by the server, if any.
    pub fn bytes_total(&self) -> Option<u64> {
        self.bytes_total
    }

    /// Current lifecycle state.
    pub fn status(&self) -> DownloadStatus {
        self.status
    }
}

/// Streams one artifact at a time to disk with O(1) memory.
pub struct Downloader {
    source: Arc<dyn ArtifactSource>,
    download_timeout: Duration,
    stall_timeout: Duration,
}

impl Downloader {
    /// Downloader with a whole-download deadline and a per-chunk stall deadline.
    pub fn new(
        source: Arc<dyn ArtifactSource>,
        download_timeout: Duration,
        stall_timeout: Duration,
    ) -> Self {
        Self {
            source,
            download_timeout,
            stall_timeout,
        }
    }

    /// Download `url` into `staging_path`, calling `on_progress` after every chunk.
    ///
    /// No retries: any transport or disk failure ends the attempt and leaves
    /// nothing at `staging_path`.
    pub async fn download<F>(
        &self,
        url: &Url,
        staging_path: &Path,
        mut on_progress: F,
    ) -> Result<DownloadSession>
    where
        F: FnMut(DownloadProgress),
    {
        discard_stale(staging_path);

        let mut session = DownloadSession::new(staging_path.to_path_buf());
        let result = match timeout(
            self.download_timeout,
            self.stream_to_disk(url, &mut session, &mut on_progress),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(UpdaterError::Timeout(self.download_timeout)),
        };

        match result {
            Ok(()) => {
                session.status = DownloadStatus::Complete;
                tracing::info!(
                    url = %url,
                    bytes = session.bytes_received,
                    path = %staging_path.display(),
                    "artifact staged"
                );
                Ok(session)
            }
            Err(err) => {
                session.status = DownloadStatus::Failed;
                discard_stale(staging_path);
                Err(err)
            }
        }
    }

    async fn stream_to_disk<F>(
        &self,
        url: &Url,
        session: &mut DownloadSession,
        on_progress: &mut F,
    ) -> Result<()>
    where
        F: FnMut(DownloadProgress),
    {
        let staging_path = session.staging_path.clone();
        let temp = create_partial(&staging_path)?;
        let mut file = tokio::fs::File::from_std(temp.as_file().try_clone()?);

        let mut stream = self.source.open(url).await?;
        session.bytes_total = stream.content_length;
        tracing::debug!(url = %url, total = ?stream.content_length, "download started");

        let started = Instant::now();
        loop {
            let next = timeout(self.stall_timeout, stream.chunks.next())
                .await
                .map_err(|_| UpdaterError::Timeout(self.stall_timeout))?;
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }

            file.write_all(&chunk).await?;
            let progress = session.record(chunk.len());
            tracing::trace!(
                received = progress.bytes_received,
                total = ?progress.bytes_total,
                "chunk written"
            );
            on_progress(progress);
        }

        if let Some(total) = session.bytes_total {
            if session.bytes_received != total {
                return Err(UpdaterError::network(format!(
                    "body ended after {} of {total} declared bytes",
                    session.bytes_received
                )));
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        // Atomic rename onto the staging path; the temp file is gone on error.
        temp.into_temp_path()
            .persist(&staging_path)
            .map_err(map_persist_error)?;
        tracing::debug!(elapsed = ?started.elapsed(), "download finished");
        Ok(())
    }
}

/// Remove a staged artifact and leftovers of interrupted downloads.
///
/// Best-effort: failures are logged and otherwise ignored.
pub fn discard_stale(staging_path: &Path) {
    remove_quietly(staging_path);

    let (Some(dir), Some(prefix)) = (staging_path.parent(), partial_prefix(staging_path)) else {
        return;
    };
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::debug!(dir = %dir.display(), error = %err, "cannot scan staging directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(prefix.to_string_lossy().as_ref()) && name.ends_with(PARTIAL_SUFFIX) {
            remove_quietly(&entry.path());
        }
    }
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed stale staging file"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "could not remove staging file")
        }
    }
}

fn partial_prefix(staging_path: &Path) -> Option<OsString> {
    let name = staging_path.file_name()?;
    let mut prefix = OsString::from(".");
    prefix.push(name);
    prefix.push(".");
    Some(prefix)
}

fn create_partial(staging_path: &Path) -> Result<NamedTempFile> {
    let parent = staging_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    if !parent.exists() {
        fs::create_dir_all(parent)?;
    }
    let prefix = partial_prefix(staging_path)
        .ok_or_else(|| UpdaterError::Config("staging path has no file name".into()))?;

    Ok(tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(PARTIAL_SUFFIX)
        .tempfile_in(parent)?)
}

fn map_persist_error(err: PathPersistError) -> UpdaterError {
    UpdaterError::Disk(err.error)
}


#[cfg(test)]
mod tests {
    use super::testing::ChunkedSource;
    use super::*;
    use tempfile::tempdir;

    fn url() -> Url {
        Url::parse("https://builds.example.com/1.0.0/setup.exe").unwrap()
    }

    fn downloader(source: ChunkedSource) -> Downloader {
        Downloader::new(
            Arc::new(source),
            Duration::from_secs(30),
            Duration::from_secs(5),
        )
    }

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_matches_file() {
        let dir = tempdir().unwrap();
        let staging = dir.path().join("update-next.exe");
        let payload = body(10_000);
        let downloader = downloader(ChunkedSource {
            body: payload.clone(),
            chunk_size: 777,
            declare_length: true,
            fail_after: None,
        });

        let mut seen = Vec::new();
        let session = downloader
            .download(&url(), &staging, |p| seen.push(p))
            .await
            .unwrap();

        assert_eq!(session.status(), DownloadStatus::Complete);
        assert!(seen.windows(2).all(|w| w[0].bytes_received <= w[1].bytes_received));
        assert!(seen.iter().all(|p| p.bytes_total == Some(10_000)));
        let written = fs::read(&staging).unwrap();
        assert_eq!(seen.last().unwrap().bytes_received, written.len() as u64);
        assert_eq!(written, payload);
    }

    #[tokio::test]
    async fn unknown_length_is_reported_as_none() {
        let dir = tempdir().unwrap();
        let staging = dir.path().join("update-next.exe");
        let downloader = downloader(ChunkedSource {
            body: body(100),
            chunk_size: 64,
            declare_length: false,
            fail_after: None,
        });

        let mut seen = Vec::new();
        let session = downloader
            .download(&url(), &staging, |p| seen.push(p))
            .await
            .unwrap();
        assert_eq!(session.bytes_total(), None);
        assert!(seen.iter().all(|p| p.bytes_total.is_none()));
        assert_eq!(session.bytes_received(), 100);
    }

    #[tokio::test]
    async fn mid_stream_failure_leaves_nothing_staged() {
        let dir = tempdir().unwrap();
        let staging = dir.path().join("update-next.exe");
        let downloader = downloader(ChunkedSource {
            body: body(1_000),
            chunk_size: 100,
            declare_length: true,
            fail_after: Some(400),
        });

        let mut last = None;
        let err = downloader
            .download(&url(), &staging, |p| last = Some(p))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::Network);
        assert_eq!(last.unwrap().bytes_received, 400);
        assert!(!staging.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn short_body_is_a_network_error() {
        struct ShortSource;

        #[async_trait::async_trait]
        impl ArtifactSource for ShortSource {
            async fn open(&self, _url: &Url) -> Result<crate::fetcher::ArtifactStream> {
                Ok(crate::fetcher::ArtifactStream {
                    content_length: Some(50),
                    chunks: futures::stream::iter(vec![Ok(bytes::Bytes::from_static(b"abc"))])
                        .boxed(),
                })
            }

            async fn fetch_bytes(&self, _url: &Url, _limit: usize) -> Result<Vec<u8>> {
                Ok(Vec::new())
            }
        }

        let dir = tempdir().unwrap();
        let staging = dir.path().join("update-next.exe");
        let downloader = Downloader::new(
            Arc::new(ShortSource),
            Duration::from_secs(30),
            Duration::from_secs(5),
        );
        let err = downloader.download(&url(), &staging, |_| {}).await.unwrap_err();
        assert!(matches!(err, UpdaterError::Network(_)));
        assert!(!staging.exists());
    }

    fn paced(chunks: Vec<&'static [u8]>, gap: Duration) -> crate::fetcher::ArtifactStream {
        let chunks = futures::stream::unfold(chunks.into_iter(), move |mut rest| async move {
            let next = rest.next()?;
            tokio::time::sleep(gap).await;
            Some((Ok(bytes::Bytes::from_static(next)), rest))
        });
        crate::fetcher::ArtifactStream {
            content_length: None,
            chunks: chunks.boxed(),
        }
    }

    struct ScriptedSource(std::sync::Mutex<Option<crate::fetcher::ArtifactStream>>);

    #[async_trait::async_trait]
    impl ArtifactSource for ScriptedSource {
        async fn open(&self, _url: &Url) -> Result<crate::fetcher::ArtifactStream> {
            self.0
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| UpdaterError::network("stream already taken"))
        }

        async fn fetch_bytes(&self, _url: &Url, _limit: usize) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_source_hits_stall_deadline() {
        let dir = tempdir().unwrap();
        let staging = dir.path().join("update-next.exe");
        let source = ScriptedSource(std::sync::Mutex::new(Some(crate::fetcher::ArtifactStream {
            content_length: Some(1_000),
            chunks: futures::stream::pending().boxed(),
        })));
        let downloader = Downloader::new(
            Arc::new(source),
            Duration::from_secs(60),
            Duration::from_secs(5),
        );

        let err = downloader.download(&url(), &staging, |_| {}).await.unwrap_err();

        assert!(
            matches!(err, UpdaterError::Timeout(d) if d == Duration::from_secs(5)),
            "{err:?}"
        );
        assert_eq!(err.kind(), crate::ErrorKind::Network);
        assert!(err.kind().is_retryable());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn trickling_source_hits_download_deadline() {
        let dir = tempdir().unwrap();
        let staging = dir.path().join("update-next.exe");
        // Every chunk beats the stall deadline; together they overrun the total.
        let chunks = vec![&b"ab"[..]; 10];
        let source = ScriptedSource(std::sync::Mutex::new(Some(paced(
            chunks,
            Duration::from_secs(1),
        ))));
        let downloader = Downloader::new(
            Arc::new(source),
            Duration::from_secs(3),
            Duration::from_secs(5),
        );

        let mut seen = 0;
        let err = downloader
            .download(&url(), &staging, |_| seen += 1)
            .await
            .unwrap_err();

        assert!(
            matches!(err, UpdaterError::Timeout(d) if d == Duration::from_secs(3)),
            "{err:?}"
        );
        assert_eq!(err.kind(), crate::ErrorKind::Network);
        assert!(seen < 10);
        assert!(!staging.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn discard_stale_removes_leftovers() {
        let dir = tempdir().unwrap();
        let staging = dir.path().join("update-next.exe");
        let partial = dir.path().join(".update-next.exe.x1Y2z3.partial");
        let unrelated = dir.path().join("keep.txt");
        fs::write(&staging, b"old").unwrap();
        fs::write(&partial, b"half").unwrap();
        fs::write(&unrelated, b"keep").unwrap();

        discard_stale(&staging);

        assert!(!staging.exists());
        assert!(!partial.exists());
        assert!(unrelated.exists());

        // Nothing to remove is not an error.
        discard_stale(&staging);
    }

    #[tokio::test]
    async fn replaces_previous_staged_artifact() {
        let dir = tempdir().unwrap();
        let staging = dir.path().join("update-next.exe");
        fs::write(&staging, b"stale installer from a crashed run").unwrap();

        let downloader = downloader(ChunkedSource {
            body: b"fresh".to_vec(),
            chunk_size: 2,
            declare_length: true,
            fail_after: None,
        });
        downloader.download(&url(), &staging, |_| {}).await.unwrap();
        assert_eq!(fs::read(&staging).unwrap(), b"fresh");
    }
}

use crate::error::{Result, UpdaterError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::{Client, Url};
use std::time::Duration;

/// Response body of an artifact request, consumed chunk by chunk.
pub struct ArtifactStream {
    /// Declared body length, `None` when the server sent no length header.
    pub content_length: Option<u64>,
    /// Single-pass sequence of body chunks.
    pub chunks: BoxStream<'static, Result<Bytes>>,
}

impl std::fmt::Debug for ArtifactStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStream")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Abstraction over the builds server.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Start streaming the body at `url`.
    async fn open(&self, url: &Url) -> Result<ArtifactStream>;

    /// Fetch a small body in full, refusing anything larger than `limit` bytes.
    async fn fetch_bytes(&self, url: &Url, limit: usize) -> Result<Vec<u8>>;
}

/// Builder for [`HttpSource`].
#[derive(Default)]
pub struct HttpSourceBuilder {
    client: Option<Client>,
    user_agent: Option<String>,
    connect_timeout: Option<Duration>,
}

impl HttpSourceBuilder {
    /// Provide a custom reqwest client instance; other settings are then ignored.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Override the `User-Agent` header.
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    /// TCP/TLS connect deadline.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Build the source.
    pub fn build(self) -> Result<HttpSource> {
        let client = match self.client {
            Some(client) => client,
            None => {
                let agent = self
                    .user_agent
                    .unwrap_or_else(|| concat!("signed-updater/", env!("CARGO_PKG_VERSION")).into());
                let mut builder = Client::builder().user_agent(agent);
                if let Some(timeout) = self.connect_timeout {
                    builder = builder.connect_timeout(timeout);
                }
                builder.build()?
            }
        };
        Ok(HttpSource { client })
    }
}

/// Plain HTTPS GETs against the builds server, no authentication.
#[derive(Clone)]
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    /// Create a new builder.
    pub fn builder() -> HttpSourceBuilder {
        HttpSourceBuilder::default()
    }
}

#[async_trait]
impl ArtifactSource for HttpSource {
    async fn open(&self, url: &Url) -> Result<ArtifactStream> {
        let response = self.client.get(url.clone()).send().await?.error_for_status()?;
        let content_length = response.content_length();
        let chunks = response.bytes_stream().map_err(UpdaterError::from).boxed();
        Ok(ArtifactStream {
            content_length,
            chunks,
        })
    }

    async fn fetch_bytes(&self, url: &Url, limit: usize) -> Result<Vec<u8>> {
        let mut response = self.client.get(url.clone()).send().await?.error_for_status()?;
        if let Some(len) = response.content_length() {
            if len > limit as u64 {
                return Err(UpdaterError::network(format!(
                    "{url} declares {len} bytes, limit is {limit}"
                )));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > limit {
                return Err(UpdaterError::network(format!(
                    "{url} exceeds the {limit} byte limit"
                )));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

/// `<base>/<version_id>/<artifact_name>`, each segment percent-encoded.
pub fn artifact_url(base: &Url, version_id: &str, artifact_name: &str) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| UpdaterError::Config(format!("builds base {base} cannot hold a path")))?
        .pop_if_empty()
        .push(version_id)
        .push(artifact_name);
    Ok(url)
}

/// The detached signature lives next to the artifact with a `.sig` suffix.
pub fn signature_url(artifact: &Url) -> Url {
    let mut url = artifact.clone();
    let path = format!("{}.sig", artifact.path());
    url.set_path(&path);
    url
}

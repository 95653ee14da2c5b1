//! HTTP client for the upstream server.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Body, Client, Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use tracing::{debug, Instrument};
use uuid::Uuid;

use outpost_core::{defaults, Error, PaginateRequest, PaginateResponse, PushData, PushFkError, Result};
use outpost_db::OpContext;

use crate::error::{UpstreamError, UpstreamResult};
use crate::metrics;

/// Upstream connection settings.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URL of the upstream server.
    pub host: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Name this agent registers under.
    pub agent_name: String,
    /// Labels attached to every push.
    pub labels: BTreeMap<String, String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl UpstreamConfig {
    pub fn new(host: impl Into<String>, agent_name: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: None,
            password: None,
            agent_name: agent_name.into(),
            labels: BTreeMap::new(),
            timeout: Duration::from_secs(defaults::UPSTREAM_TIMEOUT_SECS),
        }
    }

    /// Create config from environment variables.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `UPSTREAM_HOST` | required | Base URL of the upstream server |
    /// | `AGENT_NAME` | required | Name this agent registers under |
    /// | `UPSTREAM_USER` | none | Basic auth user |
    /// | `UPSTREAM_PASSWORD` | none | Basic auth password |
    /// | `UPSTREAM_LABELS` | none | `key=value` pairs separated by commas |
    /// | `UPSTREAM_TIMEOUT_SECS` | `60` | Per-request timeout |
    pub fn from_env() -> Result<Self> {
        let host = std::env::var("UPSTREAM_HOST")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| Error::Config("UPSTREAM_HOST is not set".into()))?;
        let agent_name = std::env::var("AGENT_NAME")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| Error::Config("AGENT_NAME is not set".into()))?;

        let labels = std::env::var("UPSTREAM_LABELS")
            .map(|v| parse_labels(&v))
            .unwrap_or_default();

        let timeout = std::env::var("UPSTREAM_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(defaults::UPSTREAM_TIMEOUT_SECS));

        Ok(Self {
            host,
            username: std::env::var("UPSTREAM_USER").ok(),
            password: std::env::var("UPSTREAM_PASSWORD").ok(),
            agent_name,
            labels,
            timeout,
        })
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Parse `k1=v1,k2=v2`. Entries without `=` are ignored.
pub fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let k = k.trim();
            (!k.is_empty()).then(|| (k.to_string(), v.trim().to_string()))
        })
        .collect()
}

/// Operations the agent needs from upstream.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    /// Name this agent is known by upstream.
    fn agent_name(&self) -> &str;

    /// Upsert rows. An empty bundle is not sent.
    async fn push(&self, ctx: &OpContext, data: &PushData) -> UpstreamResult<()>;

    /// Delete rows by primary key. An empty bundle is not sent.
    async fn delete(&self, ctx: &OpContext, data: &PushData) -> UpstreamResult<()>;

    /// Register the agent and mark it alive.
    async fn ping(&self, ctx: &OpContext) -> UpstreamResult<()>;

    /// Upstream's digest of one page of this agent's rows.
    async fn status(&self, ctx: &OpContext, req: &PaginateRequest) -> UpstreamResult<PaginateResponse>;

    /// Ids upstream holds in the same page.
    async fn pull_ids(&self, ctx: &OpContext, req: &PaginateRequest) -> UpstreamResult<Vec<String>>;
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    data: Option<JsonValue>,
}

/// `reqwest`-based [`UpstreamApi`] with HTTP basic auth.
///
/// Every request races the context's cancellation token and is recorded in
/// the upstream request metrics.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client,
    base: Url,
    config: UpstreamConfig,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> Result<Self> {
        let base = Url::parse(&config.host)
            .map_err(|e| Error::Config(format!("invalid upstream host {}: {e}", config.host)))?;
        if base.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "upstream host {} cannot be used as a base URL",
                config.host
            )));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base,
            config,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(UpstreamConfig::from_env()?)
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let req = self.client.request(method, url);
        match &self.config.username {
            Some(user) => req.basic_auth(user, self.config.password.as_deref()),
            None => req,
        }
    }

    /// Fill in the agent name and labels when the caller left them empty.
    fn stamp<'a>(&self, data: &'a PushData) -> Cow<'a, PushData> {
        if !data.agent_name.is_empty() && (self.config.labels.is_empty() || !data.labels.is_empty()) {
            return Cow::Borrowed(data);
        }
        let mut owned = data.clone();
        if owned.agent_name.is_empty() {
            owned.agent_name = self.config.agent_name.clone();
        }
        if owned.labels.is_empty() {
            owned.labels = self.config.labels.clone();
        }
        Cow::Owned(owned)
    }

    /// Run `fut` under cancellation and metrics.
    async fn call<T, F>(&self, ctx: &OpContext, method: &'static str, fut: F) -> UpstreamResult<T>
    where
        F: Future<Output = UpstreamResult<T>>,
    {
        let start = Instant::now();
        let result = if ctx.is_cancelled() {
            Err(UpstreamError::Cancelled)
        } else {
            tokio::select! {
                biased;
                _ = ctx.cancel_token().cancelled() => Err(UpstreamError::Cancelled),
                result = fut.instrument(ctx.span().clone()) => result,
            }
        };

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.outcome(),
        };
        let elapsed = start.elapsed();
        metrics::record_request(&self.config.agent_name, method, outcome, elapsed.as_secs_f64());
        debug!(
            subsystem = "upstream",
            component = "client",
            op = method,
            outcome,
            duration_ms = elapsed.as_millis() as u64,
            "Upstream request finished"
        );
        result
    }

    async fn send_push(&self, method: Method, data: &PushData) -> UpstreamResult<()> {
        let url = self.endpoint(&["upstream", "push"]);
        let resp = self
            .request(method, url)
            .query(&[("agent_name", self.config.agent_name.as_str())])
            .json(&self.stamp(data))
            .send()
            .await?;
        check(resp).await.map(|_| ())
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, query: &[(&str, String)]) -> UpstreamResult<T> {
        let resp = self.request(Method::GET, url).query(query).send().await?;
        let resp = check(resp).await?;
        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| UpstreamError::Decode(e.to_string()))
    }

    fn page_query(req: &PaginateRequest) -> [(&'static str, String); 3] {
        [
            ("table", req.table.clone()),
            ("from", req.from.clone()),
            ("size", req.size.to_string()),
        ]
    }

    /// Stream an artifact body to upstream under `artifact_id`.
    pub async fn push_artifacts<R>(&self, ctx: &OpContext, artifact_id: Uuid, reader: R) -> UpstreamResult<()>
    where
        R: AsyncRead + Send + Sync + 'static,
    {
        let id = artifact_id.to_string();
        let url = self.endpoint(&["artifacts", "upload", &id]);
        let body = Body::wrap_stream(ReaderStream::new(reader));
        self.call(ctx, "push_artifacts", async {
            let resp = self
                .request(Method::POST, url)
                .query(&[("agent_name", self.config.agent_name.as_str())])
                .body(body)
                .send()
                .await?;
            check(resp).await.map(|_| ())
        })
        .await
    }
}

/// Pass 2xx responses through; turn anything else into an error, reading a
/// foreign-key body when there is one.
async fn check(resp: Response) -> UpstreamResult<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(parse_error_body(status, body))
}

fn parse_error_body(status: u16, body: String) -> UpstreamError {
    let fk = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(|b| b.data)
        .and_then(|data| serde_json::from_value::<PushFkError>(data).ok())
        .filter(|fk| !fk.ids.is_empty());
    match fk {
        Some(fk) => UpstreamError::ForeignKey(fk),
        None => UpstreamError::Status { status, body },
    }
}

#[async_trait]
impl UpstreamApi for UpstreamClient {
    fn agent_name(&self) -> &str {
        &self.config.agent_name
    }

    async fn push(&self, ctx: &OpContext, data: &PushData) -> UpstreamResult<()> {
        if data.count() == 0 {
            return Ok(());
        }
        self.call(ctx, "push", self.send_push(Method::POST, data)).await
    }

    async fn delete(&self, ctx: &OpContext, data: &PushData) -> UpstreamResult<()> {
        if data.count() == 0 {
            return Ok(());
        }
        self.call(ctx, "delete", self.send_push(Method::DELETE, data)).await
    }

    async fn ping(&self, ctx: &OpContext) -> UpstreamResult<()> {
        let url = self.endpoint(&["upstream", "ping"]);
        self.call(ctx, "ping", async {
            let resp = self
                .request(Method::GET, url)
                .query(&[("agent_name", self.config.agent_name.as_str())])
                .send()
                .await?;
            check(resp).await.map(|_| ())
        })
        .await
    }

    async fn status(&self, ctx: &OpContext, req: &PaginateRequest) -> UpstreamResult<PaginateResponse> {
        let url = self.endpoint(&["upstream", "status", &self.config.agent_name]);
        self.call(ctx, "status", self.get_json(url, &Self::page_query(req)))
            .await
    }

    async fn pull_ids(&self, ctx: &OpContext, req: &PaginateRequest) -> UpstreamResult<Vec<String>> {
        let url = self.endpoint(&["upstream", "pull", &self.config.agent_name]);
        self.call(ctx, "pull", self.get_json(url, &Self::page_query(req)))
            .await
    }
}

//! Judge routing.
//!
//! The judging service may only be reachable from inside the worker network,
//! so the router tries a chain of [`JudgeTransport`]s in order: first a
//! connected worker acting as an HTTP bridge, then a direct call from the
//! daemon. The first transport to produce a parseable verdict wins. When all
//! fail the router returns `None` and the caller falls back.

use crate::worker::{ExecError, ExecRequest, WorkerInfo, WorkerRegistry};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use crown_core::{parse_verdict, Config, Id, Verdict};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Runs inside a worker. Reads the request from `CROWN_BRIDGE_*` variables,
/// prints the response body on 2xx, otherwise `HTTP_ERROR <status> <body>`
/// and exits non-zero.
pub const BRIDGE_SCRIPT: &str = r#"body_file=$(mktemp) || exit 1
resp_file=$(mktemp) || exit 1
trap 'rm -f "$body_file" "$resp_file"' EXIT
if ! printf '%s' "$CROWN_BRIDGE_BODY" | base64 -d > "$body_file"; then
  echo "HTTP_ERROR 0 invalid request body"
  exit 1
fi
if [ -n "$CROWN_BRIDGE_AUTH_NAME" ]; then
  set -- -H "$CROWN_BRIDGE_AUTH_NAME: $CROWN_BRIDGE_AUTH_VALUE"
else
  set --
fi
status=$(curl -sS -o "$resp_file" -w '%{http_code}' -X "$CROWN_BRIDGE_METHOD" \
  -H 'Content-Type: application/json' "$@" \
  --data-binary @"$body_file" \
  "$CROWN_BRIDGE_BASE_URL$CROWN_BRIDGE_PATH")
if [ $? -ne 0 ]; then
  echo "HTTP_ERROR 0 request failed"
  exit 1
fi
case "$status" in
  2??) cat "$resp_file" ;;
  *)
    printf 'HTTP_ERROR %s ' "$status"
    cat "$resp_file"
    echo
    exit 1
    ;;
esac
"#;

/// Prefix printed by [`BRIDGE_SCRIPT`] on a non-2xx response.
pub const HTTP_ERROR_PREFIX: &str = "HTTP_ERROR";

/// Caller credentials forwarded to the judging service.
#[derive(Clone)]
pub struct AuthContext {
    /// Full header value, e.g. `Bearer <token>`.
    pub header_value: String,
}

impl std::fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthContext")
            .field("header_value", &"<redacted>")
            .finish()
    }
}

/// Everything a transport needs to ask for a verdict.
#[derive(Debug, Clone, Copy)]
pub struct JudgeRequest<'a> {
    pub prompt: &'a str,
    pub team: &'a str,
    pub crown_run_id: Option<&'a Id>,
    pub candidate_run_ids: &'a [Id],
    pub auth: Option<&'a AuthContext>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JudgeBody<'a> {
    prompt: &'a str,
    team_slug_or_id: &'a str,
}

impl JudgeRequest<'_> {
    fn body(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&JudgeBody {
            prompt: self.prompt,
            team_slug_or_id: self.team,
        })
        .map_err(|e| TransportError::Malformed(e.to_string()))
    }
}

/// A transport failure. Every variant means "try the next transport".
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("remote exec failed: {0}")]
    Exec(#[from] ExecError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("judge returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed judge response: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// One way of reaching the judge.
#[async_trait]
pub trait JudgeTransport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn judge(&self, request: &JudgeRequest<'_>) -> Result<Verdict>;
}

fn parse_body(body: &str) -> Result<Verdict> {
    parse_verdict(body).ok_or_else(|| {
        let preview: String = body.chars().take(200).collect();
        TransportError::Malformed(preview)
    })
}

/// Sends the judge request through a connected worker's shell.
pub struct WorkerBridgeJudge {
    registry: Arc<dyn WorkerRegistry>,
    base_url: String,
    path: String,
    header_name: String,
    timeout: Duration,
}

impl WorkerBridgeJudge {
    pub fn new(registry: Arc<dyn WorkerRegistry>, config: &Config) -> Self {
        Self {
            registry,
            base_url: config.judge_base_url.clone(),
            path: config.judge_path.clone(),
            header_name: config.auth_header_name.clone(),
            timeout: config.judge_timeout(),
        }
    }

    /// Prefer a worker tied to the crown run or a candidate, else any.
    fn pick_worker(workers: Vec<WorkerInfo>, request: &JudgeRequest<'_>) -> Option<WorkerInfo> {
        let connected: Vec<WorkerInfo> = workers.into_iter().filter(|w| w.connected).collect();
        let relevant = |w: &&WorkerInfo| {
            request.crown_run_id == Some(&w.run_id) || request.candidate_run_ids.contains(&w.run_id)
        };
        connected
            .iter()
            .find(relevant)
            .or_else(|| connected.first())
            .cloned()
    }
}

#[async_trait]
impl JudgeTransport for WorkerBridgeJudge {
    fn name(&self) -> &'static str {
        "worker_bridge"
    }

    async fn judge(&self, request: &JudgeRequest<'_>) -> Result<Verdict> {
        let Some(auth) = request.auth else {
            return Err(TransportError::Unavailable("no auth context".to_string()));
        };
        if auth.header_value.contains(['\r', '\n']) {
            return Err(TransportError::Unavailable(
                "auth header contains a line break".to_string(),
            ));
        }

        let workers = self.registry.connected_workers().await;
        let Some(worker) = Self::pick_worker(workers, request) else {
            return Err(TransportError::Unavailable(
                "no connected worker".to_string(),
            ));
        };
        debug!(run_id = %worker.run_id, "judging through worker bridge");

        let exec = ExecRequest::shell(BRIDGE_SCRIPT)
            .with_env("CROWN_BRIDGE_BASE_URL", &self.base_url)
            .with_env("CROWN_BRIDGE_PATH", &self.path)
            .with_env("CROWN_BRIDGE_METHOD", "POST")
            .with_env("CROWN_BRIDGE_AUTH_NAME", &self.header_name)
            .with_env("CROWN_BRIDGE_AUTH_VALUE", &auth.header_value)
            .with_env("CROWN_BRIDGE_BODY", STANDARD.encode(request.body()?))
            .with_timeout(self.timeout);

        let output = worker.handle.exec(exec).await?;
        if !output.success() {
            let text = output.stdout.trim();
            if let Some(rest) = text
                .lines()
                .find_map(|l| l.strip_prefix(HTTP_ERROR_PREFIX))
            {
                let rest = rest.trim_start();
                let (status, body) = rest.split_once(' ').unwrap_or((rest, ""));
                return Err(TransportError::Status {
                    status: status.parse().unwrap_or(0),
                    body: body.to_string(),
                });
            }
            return Err(TransportError::Unavailable(format!(
                "bridge exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        parse_body(&output.stdout)
    }
}

/// Calls the judging service directly from the daemon.
#[derive(Debug, Clone)]
pub struct DirectJudge {
    client: reqwest::Client,
    url: String,
    header_name: String,
}

impl DirectJudge {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.judge_timeout())
            .build()?;
        Ok(Self {
            client,
            url: format!("{}{}", config.judge_base_url, config.judge_path),
            header_name: config.auth_header_name.clone(),
        })
    }
}

#[async_trait]
impl JudgeTransport for DirectJudge {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn judge(&self, request: &JudgeRequest<'_>) -> Result<Verdict> {
        let mut builder = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(request.body()?);
        if let Some(auth) = request.auth {
            builder = builder.header(self.header_name.as_str(), auth.header_value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        parse_body(&body)
    }
}

/// Tries each transport in order; the first verdict wins.
pub struct JudgeRouter {
    transports: Vec<Box<dyn JudgeTransport>>,
}

impl std::fmt::Debug for JudgeRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.transports.iter().map(|t| t.name()).collect();
        f.debug_struct("JudgeRouter")
            .field("transports", &names)
            .finish()
    }
}

impl JudgeRouter {
    pub fn new(transports: Vec<Box<dyn JudgeTransport>>) -> Self {
        Self { transports }
    }

    /// Worker bridge first, then direct.
    pub fn from_config(registry: Arc<dyn WorkerRegistry>, config: &Config) -> Result<Self> {
        Ok(Self::new(vec![
            Box::new(WorkerBridgeJudge::new(registry, config)),
            Box::new(DirectJudge::new(config)?),
        ]))
    }

    pub async fn judge(&self, request: &JudgeRequest<'_>) -> Option<Verdict> {
        for transport in &self.transports {
            match transport.judge(request).await {
                Ok(verdict) => {
                    info!(
                        transport = transport.name(),
                        winner = verdict.winner,
                        "judge returned verdict"
                    );
                    return Some(verdict);
                }
                Err(err) => {
                    warn!(
                        transport = transport.name(),
                        error = %err,
                        "judge transport failed, trying next"
                    );
                }
            }
        }
        None
    }
}

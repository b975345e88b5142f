//! Hosting credentials and commit message summarization.

use async_trait::async_trait;
use crown_core::Config;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Source of the version-control hosting token used for pull requests.
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn token(&self) -> Option<String>;
}

/// Produces a commit message from a diff. `None` means "use the default".
#[async_trait]
pub trait CommitSummarizer: Send + Sync {
    async fn summarize(&self, task_text: &str, diff: &str) -> Option<String>;
}

/// Reads `GH_TOKEN`, then `GITHUB_TOKEN`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

#[async_trait]
impl CredentialsProvider for EnvCredentials {
    async fn token(&self) -> Option<String> {
        ["GH_TOKEN", "GITHUB_TOKEN"]
            .iter()
            .filter_map(|key| std::env::var(key).ok())
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
    }
}

#[derive(Serialize)]
struct SummarizeBody<'a> {
    prompt: &'a str,
}

#[derive(Deserialize)]
struct SummarizeResponse {
    summary: Option<String>,
}

/// Asks the judging service's summarize endpoint for a commit message.
#[derive(Debug, Clone)]
pub struct HttpSummarizer {
    client: reqwest::Client,
    url: String,
}

impl HttpSummarizer {
    pub fn new(config: &Config) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.judge_timeout())
            .build()?;
        Ok(Self {
            client,
            url: format!("{}{}", config.judge_base_url, config.summarize_path),
        })
    }
}

#[async_trait]
impl CommitSummarizer for HttpSummarizer {
    async fn summarize(&self, task_text: &str, diff: &str) -> Option<String> {
        let prompt = crown_core::prompt::build_summary_prompt(task_text, diff);
        let response = match self
            .client
            .post(&self.url)
            .json(&SummarizeBody { prompt: &prompt })
            .send()
            .await
        {
            Ok(r) => r,
            Err(err) => {
                warn!(error = %err, "commit summarizer unreachable");
                return None;
            }
        };

        if !response.status().is_success() {
            warn!(status = %response.status(), "commit summarizer returned error status");
            return None;
        }

        match response.json::<SummarizeResponse>().await {
            Ok(body) => body
                .summary
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            Err(err) => {
                warn!(error = %err, "commit summarizer returned malformed body");
                None
            }
        }
    }
}

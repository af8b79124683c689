mod protocol;

pub use protocol::{CreateSubmission, Status, SubmissionDetails, SubmissionToken};

use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode};

use crate::config::RemoteConfig;
use crate::error::ExecutorError;
use crate::language::Toolchain;
use crate::model::{ExecutionRequest, ExecutionResult};
use crate::sandbox::{Executor, WorkDir};

/// Delegates execution to a Judge0-compatible HTTP service
pub struct RemoteJudge {
    client: Client,
    base_url: String,
    poll_interval: Duration,
    max_polls: u32,
    max_wall_time_limit: Duration,
}

impl RemoteJudge {
    pub fn build(config: &RemoteConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(key) = &config.api_key {
            let name = HeaderName::from_bytes(config.auth_header.as_bytes())
                .map_err(|e| anyhow!("Invalid auth header name {}: {}", config.auth_header, e))?;
            let value =
                HeaderValue::from_str(key).map_err(|e| anyhow!("Invalid API key: {}", e))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout.into())
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            poll_interval: config.poll_interval.into(),
            max_polls: config.max_polls,
            max_wall_time_limit: config.max_wall_time_limit.into(),
        })
    }

    /// Wall-clock budget requested for a run with `cpu_limit` seconds of CPU,
    /// kept within what the service accepts
    fn wall_time_limit(&self, cpu_limit: f64) -> f64 {
        (cpu_limit * 2.0 + 1.0)
            .min(self.max_wall_time_limit.as_secs_f64())
            .max(cpu_limit)
    }

    async fn submit(&self, body: &CreateSubmission<'_>) -> Result<String, ExecutorError> {
        let response = self
            .client
            .post(format!(
                "{}/submissions?base64_encoded=false&wait=false",
                self.base_url
            ))
            .json(body)
            .send()
            .await?;

        let response = check_status(response)?;
        let token: SubmissionToken = response.json().await?;
        Ok(token.token)
    }

    async fn fetch(&self, token: &str) -> Result<SubmissionDetails, ExecutorError> {
        let response = self
            .client
            .get(format!("{}/submissions/{}", self.base_url, token))
            .query(&[("base64_encoded", "false"), ("fields", protocol::DETAIL_FIELDS)])
            .send()
            .await?;

        let response = check_status(response)?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl Executor for RemoteJudge {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn execute(
        &self,
        toolchain: &Toolchain,
        request: &ExecutionRequest,
        _work_dir: &WorkDir,
    ) -> Result<ExecutionResult, ExecutorError> {
        let language_id = toolchain.remote_id.ok_or_else(|| ExecutorError::Unsupported {
            backend: "remote",
            language: toolchain.name.clone(),
        })?;

        let limit = request.time_limit.as_secs_f64();
        let token = self
            .submit(&CreateSubmission {
                source_code: &request.source_code,
                language_id,
                stdin: &request.stdin,
                cpu_time_limit: limit,
                wall_time_limit: self.wall_time_limit(limit),
                memory_limit: request.memory_limit.div_ceil(1024),
            })
            .await?;
        log::debug!("Remote submission {} created for {}", token, toolchain.name);

        for _ in 0..self.max_polls {
            tokio::time::sleep(self.poll_interval).await;

            let details = self.fetch(&token).await?;
            if details.is_finished() {
                log::debug!(
                    "Remote submission {} finished with status {} ({})",
                    token,
                    details.status.id,
                    details.status.description
                );
                return details.into_result(request.time_limit, request.memory_limit);
            }
        }

        log::warn!("Remote submission {} still pending after {} polls", token, self.max_polls);
        Err(ExecutorError::PollTimeout(self.max_polls))
    }

    async fn health_check(&self) -> Result<(), ExecutorError> {
        let response = self
            .client
            .get(format!("{}/about", self.base_url))
            .send()
            .await
            .map_err(|e| ExecutorError::Unavailable(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ExecutorError::Unavailable(format!(
                "GET /about returned {}",
                response.status()
            )))
        }
    }
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ExecutorError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::SERVICE_UNAVAILABLE => Err(ExecutorError::Unavailable(format!(
            "{} returned 503",
            response.url()
        ))),
        status => Err(ExecutorError::Remote(format!(
            "unexpected response code {} from {}",
            status,
            response.url()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MicroSecond;

    fn config(api_key: Option<&str>) -> RemoteConfig {
        RemoteConfig {
            base_url: "http://127.0.0.1:1/".to_string(),
            api_key: api_key.map(str::to_string),
            auth_header: "X-Auth-Token".to_string(),
            poll_interval: MicroSecond(1_000),
            max_polls: 2,
            request_timeout: MicroSecond(500_000),
            max_wall_time_limit: MicroSecond(20_000_000),
        }
    }

    #[test]
    fn test_build_trims_base_url() {
        let judge = RemoteJudge::build(&config(Some("secret"))).unwrap();
        assert_eq!(judge.base_url, "http://127.0.0.1:1");
        assert_eq!(judge.max_polls, 2);
    }

    #[test]
    fn test_wall_time_limit_is_clamped() {
        let judge = RemoteJudge::build(&config(None)).unwrap();
        assert_eq!(judge.wall_time_limit(1.5), 4.0);
        assert_eq!(judge.wall_time_limit(10.0), 20.0);

        let mut tight = config(None);
        tight.max_wall_time_limit = MicroSecond(5_000_000);
        let judge = RemoteJudge::build(&tight).unwrap();
        // Never below the CPU limit itself
        assert_eq!(judge.wall_time_limit(8.0), 8.0);
    }

    #[test]
    fn test_build_rejects_invalid_header_name() {
        let mut config = config(Some("secret"));
        config.auth_header = "bad header".to_string();
        assert!(RemoteJudge::build(&config).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_unavailable() {
        let judge = RemoteJudge::build(&config(None)).unwrap();
        let err = judge.health_check().await.unwrap_err();
        assert!(err.is_unavailable(), "{err}");
    }
}

// Model invocation: the collaborator that turns a prompt into generated text
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Sampling options forwarded to the model backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            seed: None,
            max_tokens: None,
            top_p: None,
        }
    }
}

/// Outcome of one generation call. Transport failures land in `error`;
/// the call itself never fails.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Invocation {
    pub output: String,
    pub latency_ms: u64,
    pub error: Option<String>,
}

impl Invocation {
    pub fn failed(error: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            output: String::new(),
            latency_ms,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn invoke(
        &self,
        prompt: &str,
        model: &str,
        sampling: &SamplingConfig,
        timeout: Duration,
    ) -> Invocation;
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// Ollama HTTP client (`POST /api/generate`, non-streaming)
pub struct OllamaClient {
    base_url: String,
    http_client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("modelab-worker/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        sampling: &SamplingConfig,
        timeout: Duration,
    ) -> Result<String> {
        let request = GenerateRequest {
            model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: sampling.temperature,
                seed: sampling.seed,
                num_predict: sampling.max_tokens,
                top_p: sampling.top_p,
            },
        };

        let response = self
            .http_client
            .post(format!("{}/api/generate", self.base_url))
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .context("Request to Ollama failed")?
            .error_for_status()
            .context("Ollama returned an error status")?;

        let body: GenerateResponse = response
            .json()
            .await
            .context("Failed to decode Ollama response")?;

        Ok(body.response.trim().to_string())
    }
}

#[async_trait]
impl ModelInvoker for OllamaClient {
    async fn invoke(
        &self,
        prompt: &str,
        model: &str,
        sampling: &SamplingConfig,
        timeout: Duration,
    ) -> Invocation {
        let start = Instant::now();
        let result = self.generate(prompt, model, sampling, timeout).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                debug!(model = model, latency_ms, chars = output.len(), "Model responded");
                Invocation {
                    output,
                    latency_ms,
                    error: None,
                }
            }
            Err(e) => {
                warn!(model = model, latency_ms, error = %format!("{:#}", e), "Model invocation failed");
                Invocation::failed(format!("{:#}", e), latency_ms)
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let request = GenerateRequest {
            model: "llama3:8b",
            prompt: "hi",
            stream: false,
            options: GenerateOptions {
                temperature: 0.0,
                seed: Some(7),
                num_predict: None,
                top_p: None,
            },
        };

        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["stream"], false);
        assert_eq!(body["options"]["seed"], 7);
        assert!(body["options"].get("num_predict").is_none());
    }

    #[test]
    fn test_sampling_defaults() {
        let sampling: SamplingConfig = serde_json::from_str(r#"{"seed": 42}"#).unwrap();
        assert_eq!(sampling.temperature, 0.7);
        assert_eq!(sampling.seed, Some(42));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_recorded_not_raised() {
        let client = OllamaClient::new("http://127.0.0.1:9/").unwrap();
        let invocation = client
            .invoke("hi", "m", &SamplingConfig::default(), Duration::from_secs(2))
            .await;

        assert!(invocation.error.is_some());
        assert!(invocation.output.is_empty());
    }
}

//! Structured-output reasoning service used to pick allocations.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

use super::normalize::TOTAL_BP;

const SYSTEM_PROMPT: &str = "You are a DeFi portfolio manager allocating a yield vault's \
    capital across its strategies. Balance expected yield against the risk scores provided. \
    Respond only with JSON matching the given schema. Allocation keys are strategy addresses \
    and values are basis points summing to 10000.";

/// Reasoning output before normalization. Allocation keys are whatever the
/// service returned; the Decision Engine filters them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReasonedAllocation {
    pub allocations: BTreeMap<String, u64>,
    pub reasoning: String,
    pub confidence: f64,
    pub expected_apy: u64,
    pub risk_score: f64,
    pub market_context: String,
}

impl ReasonedAllocation {
    /// Checks the bounds the JSON schema cannot enforce on the decoded value.
    pub(crate) fn validate(self) -> Result<Self, ReasoningError> {
        if let Some((strategy, &bp)) = self.allocations.iter().find(|(_, bp)| **bp > TOTAL_BP) {
            return Err(ReasoningError::OutOfBounds {
                field: "allocations",
                value: format!("{strategy}={bp}"),
            });
        }

        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(ReasoningError::OutOfBounds {
                field: "confidence",
                value: self.confidence.to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.risk_score) {
            return Err(ReasoningError::OutOfBounds {
                field: "riskScore",
                value: self.risk_score.to_string(),
            });
        }

        Ok(self)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReasoningError {
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error("reasoning API error (status {status}): {message}")]
    Api { status: StatusCode, message: String },
    #[error("reasoning response contained no message content")]
    EmptyResponse,
    #[error("reasoning output does not match schema: {0}")]
    Schema(#[from] serde_json::Error),
    #[error("reasoning output field {field} out of bounds: {value}")]
    OutOfBounds { field: &'static str, value: String },
    #[error("invalid reasoning endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
}

/// `generate(prompt) -> structured object`, validated against the output
/// schema before it is returned.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<ReasonedAllocation, ReasoningError>;
}

/// JSON schema of [`ReasonedAllocation`], sent as the response format.
pub(crate) fn output_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "allocations": {
                "type": "object",
                "additionalProperties": { "type": "integer", "minimum": 0, "maximum": TOTAL_BP }
            },
            "reasoning": { "type": "string" },
            "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
            "expectedApy": { "type": "integer", "minimum": 0 },
            "riskScore": { "type": "number", "minimum": 0, "maximum": 1 },
            "marketContext": { "type": "string" }
        },
        "required": [
            "allocations", "reasoning", "confidence", "expectedApy", "riskScore", "marketContext"
        ],
        "additionalProperties": false
    })
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f64,
    messages: [ChatMessage<'a>; 2],
    response_format: Value,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

/// OpenAI-compatible `chat/completions` client using `json_schema`
/// structured output.
pub struct OpenAiReasoningClient {
    client: Client,
    endpoint: Url,
    api_key: String,
    model: String,
    temperature: f64,
}

impl std::fmt::Debug for OpenAiReasoningClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiReasoningClient")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .finish_non_exhaustive()
    }
}

impl OpenAiReasoningClient {
    pub fn new(
        base_url: &Url,
        api_key: String,
        model: String,
        temperature: f64,
    ) -> Result<Self, ReasoningError> {
        let mut base = base_url.clone();
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }

        Ok(Self {
            client: Client::new(),
            endpoint: base.join("chat/completions")?,
            api_key,
            model,
            temperature,
        })
    }
}

#[async_trait]
impl ReasoningService for OpenAiReasoningClient {
    #[tracing::instrument(skip(self, prompt), fields(model = %self.model), level = tracing::Level::DEBUG)]
    async fn generate(&self, prompt: &str) -> Result<ReasonedAllocation, ReasoningError> {
        let request = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            response_format: json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "allocation_decision",
                    "schema": output_schema()
                }
            }),
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            return Err(ReasoningError::Api { status, message });
        }

        let body: ChatResponse = response.json().await?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(ReasoningError::EmptyResponse)?;

        debug!(bytes = content.len(), "Received reasoning output");

        serde_json::from_str::<ReasonedAllocation>(&content)?.validate()
    }
}

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tokio::time::Duration;

use crate::config_parser::AiConfig;
use crate::error::{DisplayOrDebugGateway, Error, ErrorDetails};
use crate::insight::QuickInsightParams;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Token counts reported by the upstream model for one completion.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct CompletionUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: CompletionUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

/// Client for the Anthropic Messages API, used to generate habit insights
/// when no cache entry or template applies.
pub struct AnthropicCoach {
    http_client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    max_tokens: u32,
}

impl AnthropicCoach {
    pub fn new(http_client: reqwest::Client, config: &AiConfig, api_key: SecretString) -> Self {
        Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_prompt(params: &QuickInsightParams) -> String {
        format!(
            "You are a concise, encouraging habit coach. The user is tracking the habit \
             \"{}\". Their current streak is {} days and their completion rate is {:.0}%. \
             Reply with one or two short sentences of specific, motivating feedback. \
             No preamble, no emoji.",
            params.habit_name.trim(),
            params.streak,
            params.completion_rate,
        )
    }

    /// Generate one insight. Returns the text plus the reported token usage.
    pub async fn generate_insight(
        &self,
        params: &QuickInsightParams,
        timeout: Duration,
    ) -> Result<(String, CompletionUsage), Error> {
        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{
                "role": "user",
                "content": Self::build_prompt(params),
            }],
        });

        let response = self
            .http_client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::InsightProvider {
                    message: format!(
                        "Request to Anthropic API failed: {}",
                        DisplayOrDebugGateway::new(e)
                    ),
                })
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::new(ErrorDetails::InsightProvider {
                message: format!("Anthropic API returned {status}: {detail}"),
            }));
        }

        let parsed: MessagesResponse = response.json().await.map_err(|e| {
            Error::new(ErrorDetails::InsightProvider {
                message: format!(
                    "Failed to parse Anthropic API response: {}",
                    DisplayOrDebugGateway::new(e)
                ),
            })
        })?;

        let text = parsed
            .content
            .iter()
            .find(|block| block.kind == "text")
            .map(|block| block.text.trim().to_string())
            .unwrap_or_default();
        if text.is_empty() {
            return Err(Error::new(ErrorDetails::InsightProvider {
                message: "Anthropic API returned an empty completion".to_string(),
            }));
        }

        Ok((text, parsed.usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_prompt_carries_the_request_fields() {
        let prompt = AnthropicCoach::build_prompt(&QuickInsightParams {
            habit_name: "Evening reading".to_string(),
            streak: 4,
            completion_rate: 71.3,
        });
        assert!(prompt.contains("Evening reading"));
        assert!(prompt.contains("4 days"));
        assert!(prompt.contains("71%"));
    }

    #[test]
    fn test_parse_messages_response() {
        let raw = r#"{
            "id": "msg_01",
            "type": "message",
            "role": "assistant",
            "content": [
                {"type": "text", "text": "Nice streak. Keep going."}
            ],
            "model": "claude-haiku-4-5",
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 52, "output_tokens": 9}
        }"#;
        let parsed: MessagesResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.content.len(), 1);
        assert_eq!(parsed.content[0].kind, "text");
        assert_eq!(parsed.usage.input_tokens, 52);
        assert_eq!(parsed.usage.output_tokens, 9);
    }

    #[test]
    fn test_parse_tolerates_unknown_fields_and_missing_usage() {
        let raw = r#"{"content": [{"type": "text", "text": "hi"}], "extra": 1}"#;
        let parsed: MessagesResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.usage.input_tokens, 0);
    }
}

//! OpenAI-compatible chat completions client.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{
    ClassificationModel, ClassificationRequest, ModelError, ModelFuture, SYSTEM_PROMPT,
    build_prompt, parse_label,
};
use crate::ModelConfig;
use crate::rate_limit::RateLimiters;

/// DashScope's OpenAI-compatible endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";
pub const DEFAULT_MODEL: &str = "qwen-turbo";

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: String,
}

/// Classifies references through a chat completions API.
pub struct ChatModel {
    client: reqwest::Client,
    config: ModelConfig,
    limiters: Arc<RateLimiters>,
}

impl ChatModel {
    pub fn new(config: ModelConfig, timeout: Duration, limiters: Arc<RateLimiters>) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ModelError::Http(e.to_string()))?;
        Ok(Self {
            client,
            config,
            limiters,
        })
    }

    fn build_request(&self, endpoint: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.endpoint.trim_end_matches('/'), endpoint);
        let mut req = self.client.post(&url);
        if let Some(ref api_key) = self.config.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }
        req.header("Content-Type", "application/json")
    }

    async fn complete(&self, prompt: &str) -> Result<String, ModelError> {
        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.0,
            max_tokens: 16,
        };

        let limiter = self.limiters.get("Model");
        if let Some(limiter) = limiter {
            limiter.acquire().await;
        }

        let response = self
            .build_request("/chat/completions")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            if let Some(limiter) = limiter {
                limiter.on_rate_limited();
            }
            return Err(ModelError::RateLimited);
        }
        if !status.is_success() {
            return Err(ModelError::Http(format!("HTTP {}", status)));
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Malformed(e.to_string()))?;
        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ModelError::Malformed("no choices in response".into()))
    }
}

impl ClassificationModel for ChatModel {
    fn name(&self) -> &str {
        &self.config.model
    }

    fn classify<'a>(&'a self, request: &'a ClassificationRequest) -> ModelFuture<'a> {
        Box::pin(async move {
            let prompt = build_prompt(request);
            let answer = self.complete(&prompt).await?;
            tracing::debug!(model = %self.config.model, answer = %answer.trim(), "model answered");
            parse_label(&answer)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_openai_shape() {
        let request = ChatCompletionRequest {
            model: DEFAULT_MODEL,
            messages: vec![ChatMessage {
                role: "user",
                content: "hi",
            }],
            temperature: 0.0,
            max_tokens: 16,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "qwen-turbo");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["max_tokens"], 16);
    }

    #[test]
    fn response_deserializes_first_choice() {
        let body = r#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"TYPE: BOOK"},"finish_reason":"stop"}]}"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.choices[0].message.content, "TYPE: BOOK");
        assert_eq!(
            parse_label(&parsed.choices[0].message.content),
            Ok(crate::DiagnosisKind::Book)
        );
    }

    #[test]
    fn request_url_joins_endpoint() {
        let model = ChatModel::new(
            ModelConfig {
                endpoint: "http://localhost:8080/v1/".into(),
                model: "m".into(),
                api_key: Some("k".into()),
            },
            Duration::from_secs(5),
            Arc::new(RateLimiters::default()),
        )
        .unwrap();
        let request = model.build_request("/chat/completions").build().unwrap();
        assert_eq!(
            request.url().as_str(),
            "http://localhost:8080/v1/chat/completions"
        );
        assert_eq!(
            request.headers()["authorization"].to_str().unwrap(),
            "Bearer k"
        );
        assert_eq!(model.name(), "m");
    }
}

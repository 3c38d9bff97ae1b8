//! Client for a local OpenAI-compatible chat endpoint (LM Studio and friends).

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CHAT_URL: &str = "http://localhost:1234/v1/chat/completions";
pub const DEFAULT_CHAT_MODEL: &str = "qwen3-8b";

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("endpoint answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected response: {0}")]
    MalformedResponse(String),
}

/// Outcome recorded next to every generated item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Ok,
    Unclear,
    ApiError,
    ParseError,
    EmptyResponse,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Ok => "ok",
            GenerationStatus::Unclear => "unclear",
            GenerationStatus::ApiError => "api_error",
            GenerationStatus::ParseError => "parse_error",
            GenerationStatus::EmptyResponse => "empty_response",
        }
    }
}

impl From<&LlmError> for GenerationStatus {
    fn from(err: &LlmError) -> Self {
        match err {
            LlmError::Transport(_) | LlmError::Status { .. } => GenerationStatus::ApiError,
            LlmError::MalformedResponse(_) => GenerationStatus::ParseError,
        }
    }
}

/// A single-turn text completion.
pub trait ChatModel {
    fn complete(&self, prompt: &str) -> Result<String, LlmError>;

    /// Checks that the backend is reachable before a long run.
    fn ping(&self) -> Result<(), LlmError> {
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ChatSettings {
    pub url: String,
    pub model: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub timeout: Duration,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_CHAT_URL.to_string(),
            model: DEFAULT_CHAT_MODEL.to_string(),
            temperature: None,
            max_tokens: None,
            timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

pub struct LmStudioClient {
    settings: ChatSettings,
    client: reqwest::blocking::Client,
}

impl LmStudioClient {
    pub fn new(settings: ChatSettings) -> Result<Self, LlmError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(settings.timeout)
            .build()?;
        Ok(Self { settings, client })
    }
}

impl ChatModel for LmStudioClient {
    // the server is up when it can list its models
    fn ping(&self) -> Result<(), LlmError> {
        let url = models_url(&self.settings.url);
        debug!("pinging {}", url);
        let response = self.client.get(&url).send()?;
        if !response.status().is_success() {
            return Err(LlmError::Status {
                status: response.status().as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        Ok(())
    }

    fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: &self.settings.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        };

        let response = self.client.post(&self.settings.url).json(&request).send()?;
        if !response.status().is_success() {
            return Err(LlmError::Status {
                status: response.status().as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }

        let body: Value = response
            .json()
            .map_err(|e| LlmError::MalformedResponse(format!("body is not JSON: {e}")))?;
        reply_content(body)
    }
}

// pulls `choices[0].message.content` out of a chat completion body
fn reply_content(body: Value) -> Result<String, LlmError> {
    let parsed: ChatResponse = serde_json::from_value(body)
        .map_err(|e| LlmError::MalformedResponse(format!("no choices[0].message: {e}")))?;
    parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::MalformedResponse("empty choices".to_string()))?
        .message
        .content
        .ok_or_else(|| LlmError::MalformedResponse("message has no content".to_string()))
}

/// The model listing endpoint next to a chat completions URL.
pub fn models_url(chat_url: &str) -> String {
    let trimmed = chat_url.trim_end_matches('/');
    if let Some(base) = trimmed.strip_suffix("/chat/completions") {
        return format!("{}/models", base);
    }
    match trimmed.rsplit_once('/') {
        Some((base, _)) => format!("{}/models", base),
        None => format!("{}/models", trimmed),
    }
}

/// Pauses between requests; zero means no pause.
pub fn pause(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// Replays canned replies in order and records every prompt it was sent.
    pub struct ScriptedChat {
        pub replies: RefCell<VecDeque<Result<String, LlmError>>>,
        pub prompts: RefCell<Vec<String>>,
    }

    impl ScriptedChat {
        pub fn new(replies: Vec<Result<String, LlmError>>) -> Self {
            Self {
                replies: RefCell::new(replies.into()),
                prompts: RefCell::new(Vec::new()),
            }
        }
    }

    impl ChatModel for ScriptedChat {
        fn complete(&self, prompt: &str) -> Result<String, LlmError> {
            self.prompts.borrow_mut().push(prompt.to_string());
            self.replies
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::MalformedResponse("script exhausted".into())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn models_url_replaces_chat_path() {
        assert_eq!(models_url(DEFAULT_CHAT_URL), "http://localhost:1234/v1/models");
        assert_eq!(models_url("http://host:8080/api/generate"), "http://host:8080/api/models");
    }

    #[test]
    fn reply_content_reads_first_choice() {
        let body = json!({"choices": [{"message": {"role": "assistant", "content": "Привет"}}]});
        assert_eq!(reply_content(body).unwrap(), "Привет");
    }

    #[test]
    fn malformed_replies_map_to_parse_error() {
        for body in [
            json!({"choices": []}),
            json!({"error": "model not loaded"}),
            json!({"choices": [{"message": {"content": null}}]}),
        ] {
            let err = reply_content(body).unwrap_err();
            assert_eq!(GenerationStatus::from(&err), GenerationStatus::ParseError);
        }
    }

    #[test]
    fn request_skips_unset_sampling_fields() {
        let request = ChatRequest {
            model: "qwen3-8b",
            messages: [ChatMessage { role: "user", content: "hi" }],
            temperature: None,
            max_tokens: Some(100),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({"model": "qwen3-8b", "messages": [{"role": "user", "content": "hi"}], "max_tokens": 100})
        );
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(serde_json::to_value(GenerationStatus::EmptyResponse).unwrap(), json!("empty_response"));
        assert_eq!(GenerationStatus::ApiError.as_str(), "api_error");
    }
}

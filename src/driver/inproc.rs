//! In-process Agent Driver.
//!
//! Calls the Anthropic Messages API directly and keeps per-conversation
//! history in memory, so agent memory survives across runs for as long as
//! the process lives. This driver performs no tool calls and therefore
//! never raises permission prompts.

use super::{AgentDriver, AgentEvent, DriverError, RunOptions};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1/messages";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: &'a [ApiMessage],
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ApiContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ApiContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: String,
}

/// Conversation id -> message history. In-memory only; durable resume state
/// lives in the Store.
type Histories = Arc<Mutex<HashMap<String, Vec<ApiMessage>>>>;

pub struct InprocDriver {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    histories: Histories,
}

impl InprocDriver {
    /// Credentials come from the user-level environment, never from the
    /// project directory.
    pub fn from_env() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: std::env::var("ANTHROPIC_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            base_url: std::env::var("ANTHROPIC_BASE_URL")
                .ok()
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: std::env::var("INPROC_MODEL")
                .ok()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            histories: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Append the user turn and snapshot the history for the API call.
    fn history_snapshot(&self, conversation_id: &str, prompt: &str) -> Vec<ApiMessage> {
        let mut histories = self.histories.lock().unwrap();
        let history = histories.entry(conversation_id.to_string()).or_default();
        history.push(ApiMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        });
        history.clone()
    }
}

fn record_assistant(histories: &Histories, conversation_id: &str, text: &str) {
    let mut histories = histories.lock().unwrap();
    if let Some(history) = histories.get_mut(conversation_id) {
        history.push(ApiMessage {
            role: "assistant".to_string(),
            content: text.to_string(),
        });
    }
}

#[async_trait]
impl AgentDriver for InprocDriver {
    async fn run(
        &self,
        prompt: &str,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<AgentEvent>, DriverError> {
        let (tx, rx) = mpsc::channel(16);

        let conversation_id = options
            .agent_conversation_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let Some(api_key) = self.api_key.clone() else {
            tokio::spawn(async move {
                let _ = tx
                    .send(AgentEvent::Result {
                        ok: false,
                        error: Some("ANTHROPIC_API_KEY not configured".to_string()),
                    })
                    .await;
            });
            return Ok(rx);
        };

        let messages = self.history_snapshot(&conversation_id, prompt);
        let request_body = serde_json::to_value(&ApiRequest {
            model: &self.model,
            max_tokens: 8192,
            messages: &messages,
        })
        .map_err(|e| DriverError::Protocol(e.to_string()))?;

        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let histories = Arc::clone(&self.histories);

        tokio::spawn(async move {
            let _ = tx
                .send(AgentEvent::SessionEstablished {
                    agent_conversation_id: conversation_id.clone(),
                })
                .await;

            let request = client
                .post(&base_url)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&request_body)
                .send();

            let response = tokio::select! {
                () = cancel.cancelled() => return, // stream just ends
                r = request => r,
            };

            let event = match response {
                Ok(resp) if resp.status().is_success() => {
                    match resp.json::<ApiResponse>().await {
                        Ok(body) => {
                            let text: String = body
                                .content
                                .iter()
                                .filter(|b| b.block_type == "text")
                                .map(|b| b.text.as_str())
                                .collect();
                            record_assistant(&histories, &conversation_id, &text);
                            if !text.is_empty() {
                                let _ = tx.send(AgentEvent::Text { delta: text }).await;
                            }
                            AgentEvent::Result { ok: true, error: None }
                        }
                        Err(e) => AgentEvent::Result {
                            ok: false,
                            error: Some(format!("model response parse error: {e}")),
                        },
                    }
                }
                Ok(resp) => AgentEvent::Result {
                    ok: false,
                    error: Some(format!("model API status {}", resp.status())),
                },
                Err(e) => AgentEvent::Result {
                    ok: false,
                    // Redact: reqwest errors can embed the full URL
                    error: Some(format!("model API request failed: {}", e.without_url())),
                },
            };

            if cancel.is_cancelled() {
                return;
            }
            let _ = tx.send(event).await;
        });

        Ok(rx)
    }
}

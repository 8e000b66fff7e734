//! The `TextAnalyzer` capability: a hosted chat model or local heuristics.
//!
//! Callers pick the arm once at construction ([`build_analyzer`]). A hosted
//! failure surfaces as [`StrataError::AnalysisDegraded`], and the caller then
//! takes the local path for that one request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use strata_shared::{
    AnalyzerConfig, AnalyzerProvider, Entity, EntityType, Result, StrataError, require_env_key,
};

use crate::entities::extract_rule_entities;
use crate::summarizer::extractive_summary;

/// Language analysis used for entities, summaries and prediction text.
#[async_trait]
pub trait TextAnalyzer: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this analyzer calls a hosted model.
    fn is_hosted(&self) -> bool;

    async fn extract_entities(&self, text: &str) -> Result<Vec<Entity>>;

    /// Summarize `text` in at most `max_chars` characters.
    async fn summarize(&self, text: &str, max_chars: usize) -> Result<String>;

    /// Answer `prompt` with a JSON object.
    async fn complete_json(&self, system: &str, prompt: &str) -> Result<Value>;
}

/// Build the analyzer selected by `[analyzer]`.
///
/// A hosted provider without its API key variable is a config error.
pub fn build_analyzer(config: &AnalyzerConfig) -> Result<Arc<dyn TextAnalyzer>> {
    let analyzer: Arc<dyn TextAnalyzer> = match config.provider {
        AnalyzerProvider::Local => Arc::new(LocalAnalyzer::new()),
        AnalyzerProvider::Openrouter => {
            let api_key = require_env_key(&config.api_key_env)?;
            Arc::new(HostedAnalyzer::new(config, api_key)?)
        }
    };
    info!(analyzer = analyzer.name(), "text analyzer ready");
    Ok(analyzer)
}

// ---------------------------------------------------------------------------
// Local
// ---------------------------------------------------------------------------

/// Rule-based extraction and extractive summaries. Never fails except for
/// free-form completion, which it cannot do.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalAnalyzer;

impl LocalAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TextAnalyzer for LocalAnalyzer {
    fn name(&self) -> &str {
        "local"
    }

    fn is_hosted(&self) -> bool {
        false
    }

    async fn extract_entities(&self, text: &str) -> Result<Vec<Entity>> {
        Ok(extract_rule_entities(text))
    }

    async fn summarize(&self, text: &str, max_chars: usize) -> Result<String> {
        Ok(extractive_summary(text, max_chars))
    }

    async fn complete_json(&self, _system: &str, _prompt: &str) -> Result<Value> {
        Err(StrataError::AnalysisDegraded(
            "local analyzer cannot generate text".into(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Hosted (OpenRouter, OpenAI-compatible chat completions)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct EntityReply {
    #[serde(default)]
    entities: Vec<EntityCandidate>,
}

#[derive(Deserialize)]
struct EntityCandidate {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    #[serde(default)]
    aliases: Vec<String>,
}

const ENTITY_SYSTEM_PROMPT: &str = "You extract named entities. Reply with a JSON object \
{\"entities\": [{\"type\": \"person|company|token|technology|concept|event\", \"name\": \"...\", \"aliases\": []}]}. \
Use ticker symbols for crypto tokens. Return an empty list when nothing qualifies.";

const SUMMARY_SYSTEM_PROMPT: &str =
    "You write neutral, factual summaries. Reply with the summary text only.";

/// Chat-completions client for an OpenAI-compatible endpoint (OpenRouter by default).
pub struct HostedAnalyzer {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HostedAnalyzer {
    pub fn new(config: &AnalyzerConfig, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| StrataError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
        })
    }

    async fn chat(&self, system: &str, prompt: &str, json: bool) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.2,
            response_format: json.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| StrataError::AnalysisDegraded(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StrataError::AnalysisDegraded(format!(
                "HTTP {status}: {body}"
            )));
        }

        let reply: ChatResponse = response
            .json()
            .await
            .map_err(|e| StrataError::AnalysisDegraded(format!("bad response: {e}")))?;

        let text = reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| StrataError::AnalysisDegraded("empty completion".into()))?;

        debug!(model = %self.model, chars = text.len(), "completion received");
        Ok(text)
    }
}

/// Parse a JSON object out of a completion, tolerating code fences and prose around it.
pub fn parse_json_reply(text: &str) -> Result<Value> {
    let start = text.find('{');
    let end = text.rfind('}');
    let body = match (start, end) {
        (Some(s), Some(e)) if e > s => &text[s..=e],
        _ => {
            return Err(StrataError::AnalysisDegraded(
                "completion contained no JSON object".into(),
            ));
        }
    };
    serde_json::from_str(body)
        .map_err(|e| StrataError::AnalysisDegraded(format!("invalid JSON in completion: {e}")))
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

#[async_trait]
impl TextAnalyzer for HostedAnalyzer {
    fn name(&self) -> &str {
        "openrouter"
    }

    fn is_hosted(&self) -> bool {
        true
    }

    async fn extract_entities(&self, text: &str) -> Result<Vec<Entity>> {
        let value = self.complete_json(ENTITY_SYSTEM_PROMPT, text).await?;
        let reply: EntityReply = serde_json::from_value(value)
            .map_err(|e| StrataError::AnalysisDegraded(format!("unexpected entity shape: {e}")))?;

        Ok(reply
            .entities
            .into_iter()
            .filter_map(|c| {
                let kind: EntityType = c.kind.parse().ok()?;
                let name = c.name.trim();
                if name.is_empty() {
                    return None;
                }
                let mut entity = Entity::new(kind, name);
                entity.aliases.extend(c.aliases);
                Some(entity)
            })
            .collect())
    }

    async fn summarize(&self, text: &str, max_chars: usize) -> Result<String> {
        let prompt = format!("Summarize in at most {max_chars} characters:\n\n{text}");
        let summary = self.chat(SUMMARY_SYSTEM_PROMPT, &prompt, false).await?;
        Ok(truncate_chars(&summary, max_chars))
    }

    async fn complete_json(&self, system: &str, prompt: &str) -> Result<Value> {
        let text = self.chat(system, prompt, true).await?;
        parse_json_reply(&text)
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn hosted(base_url: &str) -> HostedAnalyzer {
        let config = AnalyzerConfig {
            provider: AnalyzerProvider::Openrouter,
            base_url: base_url.to_string(),
            ..Default::default()
        };
        HostedAnalyzer::new(&config, "test-key".into()).unwrap()
    }

    fn completion(content: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": content } }]
        }))
    }

    #[tokio::test]
    async fn hosted_entities_are_typed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(completion(
                "```json\n{\"entities\": [{\"type\": \"token\", \"name\": \"SOL\", \"aliases\": [\"solana\"]}, {\"type\": \"planet\", \"name\": \"Mars\"}]}\n```",
            ))
            .mount(&server)
            .await;

        let entities = hosted(&server.uri())
            .extract_entities("Solana is up")
            .await
            .unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].id, "token:sol");
        assert!(entities[0].aliases.contains("solana"));
    }

    #[tokio::test]
    async fn hosted_failure_is_degraded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let err = hosted(&server.uri()).summarize("text", 50).await.unwrap_err();
        assert!(err.is_degraded());
    }

    #[tokio::test]
    async fn local_cannot_complete() {
        let err = LocalAnalyzer::new()
            .complete_json("system", "prompt")
            .await
            .unwrap_err();
        assert!(err.is_degraded());
    }

    #[test]
    fn json_reply_tolerates_prose() {
        let value = parse_json_reply("Sure! {\"a\": 1} hope that helps").unwrap();
        assert_eq!(value["a"], 1);
        assert!(parse_json_reply("no json here").is_err());
    }

    #[test]
    fn missing_key_is_a_config_error() {
        let config = AnalyzerConfig {
            provider: AnalyzerProvider::Openrouter,
            api_key_env: "STRATA_TEST_KEY_THAT_IS_NEVER_SET".into(),
            ..Default::default()
        };
        assert!(matches!(
            build_analyzer(&config),
            Err(StrataError::Config { .. })
        ));
    }
}

//! Draft generation service. Builds HTTP requests and normalizes responses
//! for both Anthropic and OpenAI-compatible APIs behind one trait.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::dsl::error::Defect;
use crate::settings::{LlmProvider, LlmProviderConfig};

/// Failure of a single generation call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail")]
pub enum ServiceError {
    #[error("generation timed out")]
    Timeout,
    #[error("rate limited by provider")]
    RateLimited,
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl ServiceError {
    /// Whether another attempt may succeed. A malformed response has
    /// already been through the local fixup pass.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::MalformedResponse(_))
    }
}

/// What went wrong with the previous draft.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub defects: Vec<Defect>,
    pub previous_draft: String,
    /// Attempt number the new draft is for.
    pub attempt: u32,
}

/// Source of DSL drafts.
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        context: Option<&Diagnostics>,
    ) -> Result<String, ServiceError>;
}

/// Service used when no provider is configured. Every call fails.
pub struct OfflineService;

#[async_trait]
impl GenerationService for OfflineService {
    async fn generate(
        &self,
        _prompt: &str,
        _context: Option<&Diagnostics>,
    ) -> Result<String, ServiceError> {
        Err(ServiceError::Unavailable(
            "regeneration is disabled in offline mode".to_string(),
        ))
    }
}

/// Resolved provider details ready for making an API call.
pub struct ResolvedProvider {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub provider: LlmProvider,
}

impl ResolvedProvider {
    /// Resolve a provider config into concrete URL / key / model values.
    ///
    /// # Errors
    /// Returns an error string if the API key is missing.
    pub fn from_config(config: &LlmProviderConfig) -> Result<Self, String> {
        let api_key = config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or("No API key configured. Run `logicforge settings set-key`.")?
            .to_string();

        match config.provider {
            LlmProvider::Anthropic => Ok(Self {
                url: "https://api.anthropic.com/v1/messages".to_string(),
                api_key,
                model: config
                    .model
                    .clone()
                    .unwrap_or_else(|| "claude-sonnet-4-20250514".to_string()),
                provider: LlmProvider::Anthropic,
            }),
            LlmProvider::OpenAiCompatible => {
                let base = config
                    .base_url
                    .as_deref()
                    .unwrap_or("https://api.openai.com/v1");
                let base = base.trim_end_matches('/');
                Ok(Self {
                    url: format!("{base}/chat/completions"),
                    api_key,
                    model: config
                        .model
                        .clone()
                        .unwrap_or_else(|| "gpt-4o".to_string()),
                    provider: LlmProvider::OpenAiCompatible,
                })
            }
        }
    }
}

/// Generation over HTTP with the configured provider.
pub struct HttpGenerationService {
    client: reqwest::Client,
    provider: ResolvedProvider,
}

impl HttpGenerationService {
    pub fn new(config: &LlmProviderConfig) -> Result<Self, String> {
        Ok(Self {
            client: reqwest::Client::new(),
            provider: ResolvedProvider::from_config(config)?,
        })
    }
}

#[async_trait]
impl GenerationService for HttpGenerationService {
    async fn generate(
        &self,
        prompt: &str,
        context: Option<&Diagnostics>,
    ) -> Result<String, ServiceError> {
        let message = crate::prompt::user_message(prompt, context);
        tracing::debug!(
            model = %self.provider.model,
            attempt = context.map_or(1, |d| d.attempt),
            "requesting draft"
        );

        let response = build_request(
            &self.client,
            &self.provider,
            crate::prompt::SYSTEM_PROMPT,
            &message,
        )
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                ServiceError::Timeout
            } else {
                ServiceError::Unavailable(format!("API request failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &text));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::MalformedResponse(format!("Failed to parse response: {e}")))?;
        let text = parse_response(self.provider.provider, &json)?;
        clean_response(&text)
    }
}

/// Map a non-success HTTP status to a service error.
fn classify_status(status: u16, body: &str) -> ServiceError {
    match status {
        429 => ServiceError::RateLimited,
        408 | 504 => ServiceError::Timeout,
        500..=599 => ServiceError::Unavailable(format!("API error {status}: {body}")),
        _ => ServiceError::MalformedResponse(format!("API error {status}: {body}")),
    }
}

/// Build an HTTP request for the resolved provider with a single user message.
pub fn build_request(
    client: &reqwest::Client,
    provider: &ResolvedProvider,
    system_prompt: &str,
    message: &str,
) -> reqwest::RequestBuilder {
    match provider.provider {
        LlmProvider::Anthropic => build_anthropic_request(client, provider, system_prompt, message),
        LlmProvider::OpenAiCompatible => {
            build_openai_request(client, provider, system_prompt, message)
        }
    }
}

/// Extract the response text from the provider's JSON.
///
/// # Errors
/// `MalformedResponse` when the JSON has no text content.
pub fn parse_response(provider: LlmProvider, json: &Value) -> Result<String, ServiceError> {
    let text = match provider {
        LlmProvider::Anthropic => parse_anthropic_response(json),
        LlmProvider::OpenAiCompatible => parse_openai_response(json),
    };
    text.filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ServiceError::MalformedResponse("response has no text content".to_string()))
}

// ── Anthropic ────────────────────────────────────────────────────

fn build_anthropic_request(
    client: &reqwest::Client,
    provider: &ResolvedProvider,
    system_prompt: &str,
    message: &str,
) -> reqwest::RequestBuilder {
    let body = serde_json::json!({
        "model": provider.model,
        "max_tokens": 4096,
        "system": system_prompt,
        "messages": [{ "role": "user", "content": message }],
    });

    client
        .post(&provider.url)
        .header("x-api-key", &provider.api_key)
        .header("anthropic-version", "2023-06-01")
        .header("content-type", "application/json")
        .json(&body)
}

fn parse_anthropic_response(json: &Value) -> Option<String> {
    let blocks = json.get("content").and_then(Value::as_array)?;
    let text: Vec<&str> = blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect();
    Some(text.join("\n"))
}

// ── OpenAI-compatible ────────────────────────────────────────────

fn build_openai_request(
    client: &reqwest::Client,
    provider: &ResolvedProvider,
    system_prompt: &str,
    message: &str,
) -> reqwest::RequestBuilder {
    let body = serde_json::json!({
        "model": provider.model,
        "max_tokens": 4096,
        "messages": [
            { "role": "system", "content": system_prompt },
            { "role": "user", "content": message },
        ],
    });

    client
        .post(&provider.url)
        .header("Authorization", format!("Bearer {}", provider.api_key))
        .header("content-type", "application/json")
        .json(&body)
}

fn parse_openai_response(json: &Value) -> Option<String> {
    json.get("choices")
        .and_then(Value::as_array)
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

// ── Response fixup ───────────────────────────────────────────────

const DSL_HEADS: &[&str] = &[
    "DEFINE", "CALL", "IF", "ELIF", "ELSE", "ENDIF", "FOR", "ENDFOR", "WHILE", "ENDWHILE", "RETURN",
];

fn is_dsl_line(line: &str) -> bool {
    let line = line.trim_start();
    if line.starts_with("{{") || line.starts_with('#') {
        return true;
    }
    let head = line
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or_default();
    DSL_HEADS.contains(&head)
}

/// Remove `<think>...</think>` sections. An unterminated one runs to the end.
fn strip_think(text: &str) -> String {
    let mut out = String::new();
    let mut rest = text;
    while let Some((before, after)) = rest.split_once("<think>") {
        out.push_str(before);
        match after.split_once("</think>") {
            Some((_, tail)) => rest = tail,
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

/// Remove chat-template tags such as `<|im_start|>`.
fn strip_template_tags(text: &str) -> String {
    let mut out = String::new();
    let mut rest = text;
    while let Some((before, after)) = rest.split_once("<|") {
        let Some((_, tail)) = after.split_once("|>") else {
            break;
        };
        out.push_str(before);
        rest = tail;
    }
    out.push_str(rest);
    out
}

/// Body of the first fenced code block, if there is one.
fn fenced_block(text: &str) -> Option<String> {
    let mut lines = text.lines().skip_while(|l| !l.trim_start().starts_with("```"));
    lines.next()?;
    let body: Vec<&str> = lines
        .take_while(|l| !l.trim_start().starts_with("```"))
        .collect();
    Some(body.join("\n"))
}

/// Local fixup pass on a raw model response: strips template tags,
/// reasoning sections, code fences and any prose before the first DSL line.
///
/// # Errors
/// `MalformedResponse` when nothing DSL-shaped remains.
pub fn clean_response(raw: &str) -> Result<String, ServiceError> {
    let text = strip_template_tags(&strip_think(raw));
    let text = fenced_block(&text).unwrap_or(text);

    let lines: Vec<&str> = text
        .lines()
        .skip_while(|line| !is_dsl_line(line))
        .collect();
    let program = lines.join("\n").trim_end().to_string();
    if program.is_empty() {
        return Err(ServiceError::MalformedResponse(
            "no DSL statements in response".to_string(),
        ));
    }
    Ok(program + "\n")
}

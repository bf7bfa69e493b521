use crate::error::AgentError;
use crate::progress;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

macro_rules! debug_eprintln {
    ($($arg:tt)*) => {
        if std::env::var("PROSEARCH_DEBUG").is_ok() {
            eprintln!($($arg)*);
        }
    };
}

const MAX_RETRIES: usize = 2;
const RETRY_DELAY_MS: u64 = 500;

/// Text generation services the control loop depends on. Workers run in
/// spawned tasks, so implementations must be shareable and their futures
/// `Send`.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Plain text generation.
    async fn generate_text(
        &self,
        prompt: &str,
        model: &str,
        temperature: f32,
    ) -> Result<String, AgentError>;

    /// Search-augmented generation: text plus grounding metadata linking
    /// spans of the text to the web resources that support them.
    async fn generate_with_search(
        &self,
        prompt: &str,
        model: &str,
        temperature: f32,
    ) -> Result<GroundedResponse, AgentError>;
}

/// Structured generation: a plain text call followed by a strict decode
/// into the schema type. Non-conformant output becomes a `SchemaParse`
/// error tagged with the calling component; the caller decides whether
/// that is fatal or mapped to a fallback.
pub async fn generate_structured<T, B>(
    backend: &B,
    component: &'static str,
    prompt: &str,
    model: &str,
    temperature: f32,
) -> Result<T, AgentError>
where
    T: DeserializeOwned,
    B: GenerationBackend + ?Sized,
{
    let raw = backend.generate_text(prompt, model, temperature).await?;
    decode_structured(&raw).map_err(|detail| AgentError::SchemaParse { component, detail })
}

/// Decode a model response into a schema type, tolerating markdown fences
/// and surrounding prose around the JSON object.
pub fn decode_structured<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
    let cleaned = strip_code_fences(raw);
    let candidate = extract_json_object(cleaned).unwrap_or_else(|| cleaned.trim().to_string());
    serde_json::from_str(&candidate).map_err(|e| e.to_string())
}

fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let without_open = if let Some(rest) = trimmed.strip_prefix("```json") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest
    } else {
        return trimmed;
    };
    without_open
        .rfind("```")
        .map(|pos| without_open[..pos].trim())
        .unwrap_or_else(|| without_open.trim())
}

// Find the first balanced JSON object in the text, respecting strings and
// escapes.
fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut brace_count = 0;
    let mut in_string = false;
    let mut escape = false;

    for (byte_idx, ch) in text[start..].char_indices() {
        if escape {
            escape = false;
            continue;
        }

        if ch == '\\' {
            escape = true;
            continue;
        }

        if ch == '"' {
            in_string = !in_string;
        }

        if !in_string {
            match ch {
                '{' => brace_count += 1,
                '}' => {
                    brace_count -= 1;
                    if brace_count == 0 {
                        return Some(text[start..start + byte_idx + ch.len_utf8()].to_string());
                    }
                }
                _ => {}
            }
        }
    }
    None
}

/// Result of a search-augmented generation call.
#[derive(Debug, Clone, Default)]
pub struct GroundedResponse {
    pub text: String,
    pub chunks: Vec<GroundingChunk>,
    pub supports: Vec<GroundingSupport>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroundingChunk {
    pub web: WebChunk,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebChunk {
    pub uri: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroundingSupport {
    pub segment: SupportSegment,
    #[serde(rename = "groundingChunkIndices", default)]
    pub grounding_chunk_indices: Vec<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupportSegment {
    #[serde(rename = "startIndex")]
    pub start_index: Option<usize>,
    #[serde(rename = "endIndex")]
    pub end_index: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
    #[serde(rename = "groundingMetadata")]
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct GroundingMetadata {
    #[serde(rename = "groundingChunks", default)]
    grounding_chunks: Vec<GroundingChunk>,
    #[serde(rename = "groundingSupports", default)]
    grounding_supports: Vec<GroundingSupport>,
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<RequestContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
}

#[derive(Debug, Serialize)]
struct RequestContent {
    parts: Vec<RequestPart>,
}

#[derive(Debug, Serialize)]
struct RequestPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
}

/// HTTP wrapper for the Gemini `generateContent` endpoint. Transient
/// failures (transport errors, 5xx) are retried a small fixed number of
/// times with a short pause; 4xx responses fail immediately.
pub struct GeminiClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        GeminiClient {
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    #[allow(dead_code)]
    pub fn with_base_url(base_url: String, api_key: String) -> Self {
        GeminiClient {
            base_url,
            api_key,
            client: reqwest::Client::new(),
        }
    }

    async fn generate(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse, AgentError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        );
        let context = format!("generateContent model={}", model);

        let mut attempt = 0;
        loop {
            attempt += 1;
            progress::log_with(
                progress::Kind::Http,
                format!("POST {} (attempt {})", context, attempt),
            );

            let result = self.client.post(&url).json(request).send().await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<GenerateContentResponse>()
                            .await
                            .map_err(|e| AgentError::service(&context, e));
                    }

                    let retryable = status.is_server_error();
                    let body = response.text().await.unwrap_or_default();
                    if !retryable || attempt > MAX_RETRIES {
                        return Err(AgentError::service(
                            &context,
                            format!("API error {}: {}", status, body),
                        ));
                    }
                    debug_eprintln!(
                        "[genai] {} returned {}, retrying ({}/{})",
                        context,
                        status,
                        attempt,
                        MAX_RETRIES
                    );
                }
                Err(e) => {
                    if attempt > MAX_RETRIES {
                        return Err(AgentError::service(&context, e));
                    }
                    debug_eprintln!(
                        "[genai] {} transport error: {}, retrying ({}/{})",
                        context,
                        e,
                        attempt,
                        MAX_RETRIES
                    );
                }
            }

            tokio::time::sleep(tokio::time::Duration::from_millis(RETRY_DELAY_MS)).await;
        }
    }
}

fn collect_text(response: &GenerateContentResponse) -> String {
    response
        .candidates
        .first()
        .and_then(|c| c.content.as_ref())
        .map(|content| {
            content
                .parts
                .iter()
                .map(|p| p.text.as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

#[async_trait]
impl GenerationBackend for GeminiClient {
    async fn generate_text(
        &self,
        prompt: &str,
        model: &str,
        temperature: f32,
    ) -> Result<String, AgentError> {
        let request = GenerateContentRequest {
            contents: vec![RequestContent {
                parts: vec![RequestPart {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig { temperature },
            tools: None,
        };

        let response = self.generate(model, &request).await?;
        Ok(collect_text(&response))
    }

    async fn generate_with_search(
        &self,
        prompt: &str,
        model: &str,
        temperature: f32,
    ) -> Result<GroundedResponse, AgentError> {
        let request = GenerateContentRequest {
            contents: vec![RequestContent {
                parts: vec![RequestPart {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig { temperature },
            tools: Some(vec![json!({ "google_search": {} })]),
        };

        let response = self.generate(model, &request).await?;
        let text = collect_text(&response);
        let metadata = response
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.grounding_metadata)
            .unwrap_or_default();

        Ok(GroundedResponse {
            text,
            chunks: metadata.grounding_chunks,
            supports: metadata.grounding_supports,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        count: usize,
    }

    #[test]
    fn test_decode_plain_json() {
        let decoded: Sample = decode_structured(r#"{"name": "a", "count": 2}"#).unwrap();
        assert_eq!(decoded.count, 2);
    }

    #[test]
    fn test_decode_fenced_json() {
        let raw = "```json\n{\"name\": \"a\", \"count\": 2}\n```";
        let decoded: Sample = decode_structured(raw).unwrap();
        assert_eq!(decoded.name, "a");
    }

    #[test]
    fn test_decode_json_with_surrounding_prose() {
        let raw = "Here is the result:\n{\"name\": \"a\", \"count\": 3}\nHope that helps.";
        let decoded: Sample = decode_structured(raw).unwrap();
        assert_eq!(decoded.count, 3);
    }

    #[test]
    fn test_decode_nonconformant_fails() {
        let result: Result<Sample, _> = decode_structured("no json here");
        assert!(result.is_err());
    }

    #[test]
    fn test_extract_json_object_respects_strings() {
        let text = r#"prefix {"a": "brace } in string", "b": 1} suffix"#;
        let extracted = extract_json_object(text).unwrap();
        assert_eq!(extracted, r#"{"a": "brace } in string", "b": 1}"#);
    }

    #[test]
    fn test_grounding_response_deserializes() {
        let raw = r#"{
            "candidates": [{
                "content": {"parts": [{"text": "Rust is memory safe."}]},
                "groundingMetadata": {
                    "groundingChunks": [
                        {"web": {"uri": "https://a.example/page", "title": "a.example"}}
                    ],
                    "groundingSupports": [
                        {"segment": {"startIndex": 0, "endIndex": 20}, "groundingChunkIndices": [0]}
                    ]
                }
            }]
        }"#;
        let response: GenerateContentResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(collect_text(&response), "Rust is memory safe.");

        let metadata = response.candidates[0].grounding_metadata.as_ref().unwrap();
        assert_eq!(metadata.grounding_chunks[0].web.uri, "https://a.example/page");
        assert_eq!(metadata.grounding_supports[0].segment.end_index, Some(20));
    }
}

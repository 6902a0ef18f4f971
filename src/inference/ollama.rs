// =============================================================================
// Ollama Backend: local model served over HTTP
// =============================================================================
//
// POST /api/generate with `format: "json"`; the model is asked to answer with
// `{ "score": 0..1, "claims": [...] }` and nothing else.
// =============================================================================

use std::fmt::Write as _;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};

use super::{InferenceBackend, ModelError, ModelOutput};
use crate::context::MergedContext;

const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "qwen2.5:7b-instruct";
const MAX_EVIDENCE_IN_PROMPT: usize = 8;

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    format: &'a str,
    options: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Clone)]
pub struct OllamaBackend {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaBackend {
    pub fn new(base_url: Option<String>, model: Option<String>) -> Result<Self> {
        // Per-request timeouts are enforced by the inference stage.
        let client = reqwest::Client::builder()
            .build()
            .context("failed to build model HTTP client")?;

        Ok(Self {
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            client,
        })
    }
}

/// Render the prompt for one entity.
pub fn build_prompt(context: &MergedContext) -> String {
    let key = context.key();
    let mut prompt = format!(
        "You are a quantitative analyst producing a tournament signal for {} as of {}.\n\n",
        key.entity_id, key.as_of
    );

    prompt.push_str("Fundamentals:\n");
    for (name, field) in context.fields() {
        let _ = writeln!(prompt, "- {name}: {} (source: {})", field.value, field.provenance.source);
    }

    prompt.push_str("\nEvidence:\n");
    for ev in context.evidence().iter().take(MAX_EVIDENCE_IN_PROMPT) {
        let _ = writeln!(prompt, "- [{}] {}: {}", ev.source, ev.passage.title, ev.passage.text);
    }

    prompt.push_str(
        "\nReturn ONLY valid JSON of the form:\n\
         {\"score\": <number between 0 and 1>, \"claims\": [\
         {\"text\": <statement>, \"field\": <fundamentals field or null>, \
         \"value\": <number or null>, \"materiality\": \"Core\" | \"Peripheral\"}]}\n\
         Mark claims the score depends on as Core. Only state facts found above.\n",
    );
    prompt
}

/// Parse the model's JSON answer.
pub fn parse_output(raw: &str) -> Result<ModelOutput, ModelError> {
    serde_json::from_str::<ModelOutput>(raw.trim())
        .map_err(|e| ModelError::InvalidOutput(format!("could not parse model JSON: {e}")))
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    fn name(&self) -> &str {
        &self.model
    }

    #[instrument(skip(self, context), fields(model = %self.model, key = %context.key()), name = "ollama::infer")]
    async fn infer(&self, context: &MergedContext) -> Result<ModelOutput, ModelError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model: &self.model,
            prompt: build_prompt(context),
            stream: false,
            format: "json",
            options: json!({ "temperature": 0.1 }),
        };

        let resp = self.client.post(&url).json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                ModelError::Timeout { after_ms: 0 }
            } else {
                ModelError::Overload(e.to_string())
            }
        })?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(ModelError::Overload(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(ModelError::InvalidOutput(format!("HTTP {status}")));
        }

        let body: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| ModelError::InvalidOutput(e.to_string()))?;

        let output = parse_output(&body.response)?;
        debug!(score = output.score, claims = output.claims.len(), "model answered");
        Ok(output)
    }
}

impl std::fmt::Debug for OllamaBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaBackend")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

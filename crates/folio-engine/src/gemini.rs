use std::time::Duration;

use anyhow::{bail, Context, Result};
use folio_contracts::data_url::DataUrl;
use folio_contracts::error::FolioError;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};

use crate::model::{GenerativeModel, ImageRequest, JsonRequest, Part, TextRequest};
use crate::truncate_text;

/// Gemini `generateContent` transport for text, JSON and image output.
pub struct GeminiModel {
    api_base: String,
    api_key: String,
    text_model: String,
    image_model: String,
    timeout: Duration,
    http: HttpClient,
}

impl GeminiModel {
    pub fn new(
        api_base: &str,
        api_key: impl Into<String>,
        text_model: impl Into<String>,
        image_model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .context("failed to build Gemini HTTP client")?;
        Ok(Self {
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            text_model: text_model.into(),
            image_model: image_model.into(),
            timeout,
            http,
        })
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn default_safety_settings() -> Vec<Value> {
        [
            "HARM_CATEGORY_HARASSMENT",
            "HARM_CATEGORY_HATE_SPEECH",
            "HARM_CATEGORY_SEXUALLY_EXPLICIT",
            "HARM_CATEGORY_DANGEROUS_CONTENT",
        ]
        .into_iter()
        .map(|category| {
            json!({
                "category": category,
                "threshold": "BLOCK_ONLY_HIGH",
            })
        })
        .collect()
    }

    fn build_payload(parts: &[Part], generation_config: Map<String, Value>) -> Value {
        let mut payload = Map::new();
        payload.insert(
            "contents".to_string(),
            Value::Array(vec![json!({
                "role": "user",
                "parts": parts.iter().map(part_json).collect::<Vec<Value>>(),
            })]),
        );
        if !generation_config.is_empty() {
            payload.insert(
                "generationConfig".to_string(),
                Value::Object(generation_config),
            );
        }
        payload.insert(
            "safetySettings".to_string(),
            Value::Array(Self::default_safety_settings()),
        );
        Value::Object(payload)
    }

    fn post(&self, model: &str, payload: &Value) -> Result<Value> {
        let endpoint = self.endpoint_for_model(model);
        tracing::debug!(%endpoint, timeout_s = self.timeout.as_secs_f64(), "gemini request");
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(payload)
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        response_json_or_error("Gemini", response)
    }
}

impl GenerativeModel for GeminiModel {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate_json(&self, request: &JsonRequest) -> Result<Value> {
        let mut generation_config = Map::new();
        generation_config.insert(
            "responseMimeType".to_string(),
            Value::String("application/json".to_string()),
        );
        generation_config.insert("responseSchema".to_string(), request.schema.clone());
        let payload = Self::build_payload(&request.parts, generation_config);
        let response = self.post(&self.text_model, &payload)?;
        let text = extract_text(&response).context("Gemini returned no JSON text")?;
        parse_json_text(&text)
    }

    fn generate_text(&self, request: &TextRequest) -> Result<String> {
        let payload = Self::build_payload(&request.parts, Map::new());
        let response = self.post(&self.text_model, &payload)?;
        extract_text(&response).context("Gemini returned no text")
    }

    fn generate_image(&self, request: &ImageRequest) -> Result<DataUrl> {
        let mut generation_config = Map::new();
        generation_config.insert(
            "responseModalities".to_string(),
            Value::Array(vec![Value::String("IMAGE".to_string())]),
        );
        if let Some(aspect_ratio) = request.aspect_ratio {
            generation_config.insert(
                "imageConfig".to_string(),
                json!({ "aspectRatio": aspect_ratio.ratio() }),
            );
        }
        let payload = Self::build_payload(&request.parts, generation_config);
        let response = self.post(&self.image_model, &payload)?;
        match extract_first_image(&response)? {
            Some(image) => Ok(image),
            None => Err(FolioError::data_integrity(format!(
                "Gemini response contained no inline image{}",
                finish_reason_suffix(&response)
            ))
            .into()),
        }
    }
}

fn part_json(part: &Part) -> Value {
    match part {
        Part::Text(text) => json!({ "text": text }),
        Part::Image(image) => json!({
            "inlineData": {
                "mimeType": image.mime_type(),
                "data": image.base64(),
            }
        }),
    }
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn candidate_parts(response: &Value) -> impl Iterator<Item = &Value> {
    response
        .get("candidates")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|candidate| {
            candidate
                .get("content")
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
        })
        .flatten()
}

/// Concatenated text of every non-thought part.
fn extract_text(response: &Value) -> Option<String> {
    let text = candidate_parts(response)
        .filter(|part| !part.get("thought").and_then(Value::as_bool).unwrap_or(false))
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<&str>>()
        .join("");
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_string())
}

fn extract_first_image(response: &Value) -> Result<Option<DataUrl>> {
    for part in candidate_parts(response) {
        let Some(inline) = part
            .get("inlineData")
            .or_else(|| part.get("inline_data"))
            .and_then(Value::as_object)
        else {
            continue;
        };
        let data = inline
            .get("data")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if data.is_empty() {
            continue;
        }
        let mime_type = inline
            .get("mimeType")
            .or_else(|| inline.get("mime_type"))
            .and_then(Value::as_str)
            .unwrap_or("image/png");
        let image = DataUrl::from_base64(mime_type, data)
            .context("Gemini returned a malformed inline image")?;
        return Ok(Some(image));
    }
    Ok(None)
}

fn finish_reason_suffix(response: &Value) -> String {
    response
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("finishReason"))
        .and_then(Value::as_str)
        .map(|reason| format!(" (finish reason {reason})"))
        .unwrap_or_default()
}

/// Parses model JSON output, tolerating a surrounding markdown fence.
pub(crate) fn parse_json_text(text: &str) -> Result<Value> {
    let trimmed = text.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(unfenced.trim()).with_context(|| {
        format!(
            "model returned invalid JSON: {}",
            truncate_text(unfenced.trim(), 200)
        )
    })
}

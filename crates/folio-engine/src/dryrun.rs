use std::io::Cursor;

use anyhow::{Context, Result};
use folio_contracts::data_url::DataUrl;
use folio_contracts::story::AspectRatio;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::model::{GenerativeModel, ImageRequest, JsonRequest, Part, TextRequest};

/// Deterministic offline model; every answer is derived from the request text.
#[derive(Debug, Clone)]
pub struct DryrunModel {
    text_model: String,
    image_model: String,
}

impl Default for DryrunModel {
    fn default() -> Self {
        Self::new("dryrun-text-1", "dryrun-image-1")
    }
}

impl DryrunModel {
    pub fn new(text_model: impl Into<String>, image_model: impl Into<String>) -> Self {
        Self {
            text_model: text_model.into(),
            image_model: image_model.into(),
        }
    }
}

impl GenerativeModel for DryrunModel {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate_json(&self, request: &JsonRequest) -> Result<Value> {
        let seed = request_text(&request.parts);
        tracing::debug!(model = %self.text_model, "dryrun json");
        Ok(fill_schema(&request.schema, "value", &seed))
    }

    fn generate_text(&self, request: &TextRequest) -> Result<String> {
        let seed = request_text(&request.parts);
        Ok(format!("Dryrun Story {}", short_id(&seed, 0)))
    }

    fn generate_image(&self, request: &ImageRequest) -> Result<DataUrl> {
        let prompt = request.text();
        let references = request.images().count() as u64;
        let (width, height) = dims_for(request.aspect_ratio.unwrap_or_default());
        let (r, g, b) = color_from_prompt(&prompt, references);
        let image = RgbImage::from_pixel(width, height, Rgb([r, g, b]));
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .context("failed to encode dryrun image")?;
        tracing::debug!(model = %self.image_model, width, height, "dryrun image");
        Ok(DataUrl::from_bytes("image/png", &bytes))
    }
}

fn request_text(parts: &[Part]) -> String {
    parts
        .iter()
        .filter_map(Part::as_text)
        .collect::<Vec<&str>>()
        .join("\n")
}

fn dims_for(aspect_ratio: AspectRatio) -> (u32, u32) {
    match aspect_ratio {
        AspectRatio::Square => (64, 64),
        AspectRatio::Portrait => (48, 64),
        AspectRatio::Landscape => (64, 48),
        AspectRatio::Tall => (36, 64),
        AspectRatio::Wide => (64, 36),
    }
}

/// Builds a value satisfying a Gemini-style response schema.
fn fill_schema(schema: &Value, name: &str, seed: &str) -> Value {
    if let Some(first) = schema
        .get("enum")
        .and_then(Value::as_array)
        .and_then(|values| values.first())
    {
        return first.clone();
    }
    let kind = schema
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("string")
        .to_ascii_lowercase();
    match kind.as_str() {
        "object" => {
            let mut out = Map::new();
            if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
                for (key, property) in properties {
                    out.insert(key.clone(), fill_schema(property, key, seed));
                }
            }
            Value::Object(out)
        }
        "array" => {
            let min_items = schema
                .get("minItems")
                .and_then(|raw| {
                    raw.as_u64()
                        .or_else(|| raw.as_str().and_then(|text| text.parse().ok()))
                })
                .unwrap_or(1)
                .max(1);
            let items = schema.get("items").cloned().unwrap_or(Value::Null);
            Value::Array(
                (0..min_items)
                    .map(|idx| fill_schema(&items, name, &format!("{seed}#{idx}")))
                    .collect(),
            )
        }
        "integer" | "number" => Value::from(0),
        "boolean" => Value::Bool(false),
        _ => Value::String(format!("{name} {}", short_id(seed, name.len() as u64))),
    }
}

fn color_from_prompt(prompt: &str, seed: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn short_id(prompt: &str, idx: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(idx.to_be_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn images_are_deterministic_pngs_sized_by_aspect_ratio() -> anyhow::Result<()> {
        let model = DryrunModel::default();
        let request = ImageRequest {
            parts: vec![Part::text("a lantern in the rain")],
            aspect_ratio: Some(AspectRatio::Tall),
        };
        let first = model.generate_image(&request)?;
        let second = model.generate_image(&request)?;
        assert_eq!(first, second);
        assert_eq!(first.mime_type(), "image/png");

        let decoded = image::load_from_memory(&first.decode()?)?;
        assert_eq!((decoded.width(), decoded.height()), (36, 64));
        Ok(())
    }

    #[test]
    fn different_prompts_give_different_colours() {
        assert_ne!(color_from_prompt("storm", 0), color_from_prompt("calm", 0));
    }

    #[test]
    fn json_fills_schema_with_min_items() -> anyhow::Result<()> {
        let model = DryrunModel::default();
        let schema = json!({
            "type": "OBJECT",
            "properties": {
                "scenes": {
                    "type": "ARRAY",
                    "minItems": 3,
                    "items": {
                        "type": "OBJECT",
                        "properties": {
                            "summary": { "type": "STRING" },
                            "characters": { "type": "ARRAY", "items": { "type": "STRING" } },
                            "mood": { "type": "STRING", "enum": ["tense", "calm"] }
                        }
                    }
                }
            }
        });
        let value = model.generate_json(&JsonRequest {
            parts: vec![Part::text("Kai walked.")],
            schema,
        })?;
        let scenes = value["scenes"].as_array().cloned().unwrap_or_default();
        assert_eq!(scenes.len(), 3);
        assert!(scenes[0]["summary"].as_str().unwrap_or("").starts_with("summary "));
        assert_eq!(scenes[0]["characters"].as_array().map(Vec::len), Some(1));
        assert_eq!(scenes[2]["mood"], "tense");
        assert_ne!(scenes[0]["summary"], scenes[1]["summary"]);
        Ok(())
    }

    #[test]
    fn text_is_short_and_stable() -> anyhow::Result<()> {
        let model = DryrunModel::default();
        let request = TextRequest {
            parts: vec![Part::text("title please")],
        };
        let title = model.generate_text(&request)?;
        assert_eq!(title, model.generate_text(&request)?);
        assert!(title.starts_with("Dryrun Story "));
        Ok(())
    }
}

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use folio_contracts::data_url::DataUrl;
use serde_json::{json, Value};

use crate::model::{GenerativeModel, ImageRequest, JsonRequest, TextRequest};

type Scripted<T> = Result<T, String>;

/// Replays queued responses in order and records every request.
#[derive(Default)]
pub struct ScriptedModel {
    json: Mutex<VecDeque<Scripted<Value>>>,
    text: Mutex<VecDeque<Scripted<String>>>,
    images: Mutex<VecDeque<Scripted<DataUrl>>>,
    json_requests: Mutex<Vec<JsonRequest>>,
    text_requests: Mutex<Vec<TextRequest>>,
    image_requests: Mutex<Vec<ImageRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_json(&self, response: Scripted<Value>) {
        self.json.lock().unwrap().push_back(response);
    }

    pub fn push_text(&self, response: Scripted<String>) {
        self.text.lock().unwrap().push_back(response);
    }

    pub fn push_image(&self, response: Scripted<DataUrl>) {
        self.images.lock().unwrap().push_back(response);
    }

    pub fn json_requests(&self) -> Vec<JsonRequest> {
        self.json_requests.lock().unwrap().clone()
    }

    pub fn text_requests(&self) -> Vec<TextRequest> {
        self.text_requests.lock().unwrap().clone()
    }

    pub fn image_requests(&self) -> Vec<ImageRequest> {
        self.image_requests.lock().unwrap().clone()
    }
}

fn next<T>(queue: &Mutex<VecDeque<Scripted<T>>>, what: &str) -> Result<T> {
    match queue.lock().unwrap().pop_front() {
        Some(Ok(value)) => Ok(value),
        Some(Err(message)) => Err(anyhow!(message)),
        None => Err(anyhow!("scripted model has no queued {what} response")),
    }
}

impl GenerativeModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    fn generate_json(&self, request: &JsonRequest) -> Result<Value> {
        self.json_requests.lock().unwrap().push(request.clone());
        next(&self.json, "json")
    }

    fn generate_text(&self, request: &TextRequest) -> Result<String> {
        self.text_requests.lock().unwrap().push(request.clone());
        next(&self.text, "text")
    }

    fn generate_image(&self, request: &ImageRequest) -> Result<DataUrl> {
        self.image_requests.lock().unwrap().push(request.clone());
        next(&self.images, "image")
    }
}

pub fn character_json() -> Value {
    json!({
        "face": {
            "shape": "heart-shaped",
            "age": "early twenties",
            "skinTone": "olive",
            "eyes": { "color": "amber", "shape": "almond", "size": "large" },
            "nose": "narrow",
            "mouth": "full lips",
            "distinctiveMarks": ["scar over left brow"]
        },
        "hair": {
            "color": "jet black",
            "length": "shoulder length",
            "style": "loose waves",
            "parting": "side",
            "texture": "thick"
        },
        "body": { "build": "lean", "height": "tall", "posture": "upright" },
        "outfit": {
            "upperBody": "navy travel coat",
            "lowerBody": "grey trousers",
            "accessories": ["leather satchel"],
            "colors": ["navy", "grey"],
            "style": "practical"
        },
        "overallVibe": "restless wanderer"
    })
}

pub fn background_json() -> Value {
    json!({
        "location": { "type": "forest", "setting": "old growth", "architecture": "none" },
        "lighting": {
            "source": ["setting sun"],
            "quality": "soft",
            "timeOfDay": "dusk",
            "mood": "hushed"
        },
        "colors": {
            "dominant": ["moss green"],
            "accents": ["amber"],
            "palette": "warm earth"
        },
        "objects": [
            { "item": "fallen log", "description": "mossy", "prominence": "foreground" }
        ],
        "atmosphere": "quiet and expectant"
    })
}

pub fn art_style_json() -> Value {
    json!({
        "medium": "watercolour",
        "technique": {
            "rendering": "loose washes",
            "lineWork": "fine ink outlines",
            "edgeQuality": "soft"
        },
        "colorApplication": {
            "style": "wet on wet",
            "saturation": "muted",
            "blending": "bleeding edges"
        },
        "shadingAndLighting": {
            "shadingStyle": "layered glazes",
            "contrast": "low",
            "lightingType": "diffuse"
        },
        "styleGenre": "storybook",
        "mood": "gentle",
        "distinctiveFeatures": ["paper texture visible"]
    })
}

pub fn png(tag: &str) -> DataUrl {
    DataUrl::from_bytes("image/png", tag.as_bytes())
}

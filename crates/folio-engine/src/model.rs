use anyhow::Result;
use folio_contracts::data_url::DataUrl;
use folio_contracts::story::AspectRatio;
use serde_json::Value;

/// One piece of a multimodal request, sent in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    Image(DataUrl),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Image(_) => None,
        }
    }
}

/// Structured output constrained by a response schema.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRequest {
    pub parts: Vec<Part>,
    pub schema: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextRequest {
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub parts: Vec<Part>,
    pub aspect_ratio: Option<AspectRatio>,
}

impl ImageRequest {
    /// All text parts joined by blank lines, in request order.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .collect::<Vec<&str>>()
            .join("\n\n")
    }

    pub fn images(&self) -> impl Iterator<Item = &DataUrl> {
        self.parts.iter().filter_map(|part| match part {
            Part::Image(image) => Some(image),
            Part::Text(_) => None,
        })
    }
}

/// A multimodal model endpoint. Calls are blocking and never retried.
pub trait GenerativeModel: Send + Sync {
    fn name(&self) -> &str;
    fn generate_json(&self, request: &JsonRequest) -> Result<Value>;
    fn generate_text(&self, request: &TextRequest) -> Result<String>;
    /// The first image the model returns.
    fn generate_image(&self, request: &ImageRequest) -> Result<DataUrl>;
}

impl<M: GenerativeModel + ?Sized> GenerativeModel for Box<M> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn generate_json(&self, request: &JsonRequest) -> Result<Value> {
        (**self).generate_json(request)
    }

    fn generate_text(&self, request: &TextRequest) -> Result<String> {
        (**self).generate_text(request)
    }

    fn generate_image(&self, request: &ImageRequest) -> Result<DataUrl> {
        (**self).generate_image(request)
    }
}

use std::fmt;

use indexmap::IndexMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Plain or schema-constrained text output.
    Text,
    /// Accepts images as input.
    Vision,
    /// Produces images.
    Image,
    /// Produces an image from an instruction plus a source image.
    Edit,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Text => "text",
            Self::Vision => "vision",
            Self::Image => "image",
            Self::Edit => "edit",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Gemini,
    Dryrun,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: Provider,
    pub capabilities: Vec<Capability>,
    pub context_window: Option<u64>,
}

impl ModelSpec {
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Known models in preference order; the first match for a capability is the default.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    /// Registry holding only the offline dryrun models.
    pub fn dryrun() -> Self {
        let models = default_models()
            .into_iter()
            .filter(|(_, spec)| spec.provider == Provider::Dryrun)
            .collect();
        Self { models }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: Capability) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: Capability) -> Option<ModelSpec> {
        self.get(name)
            .filter(|model| model.supports(capability))
            .cloned()
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();
    let mut insert = |name: &str,
                      provider: Provider,
                      capabilities: &[Capability],
                      context_window: Option<u64>| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider,
                capabilities: capabilities.to_vec(),
                context_window,
            },
        );
    };

    use Capability::{Edit, Image, Text, Vision};
    insert(
        "gemini-2.5-flash",
        Provider::Gemini,
        &[Text, Vision],
        Some(1_048_576),
    );
    insert("gemini-2.5-flash-image", Provider::Gemini, &[Image, Edit], None);
    insert("gemini-2.5-pro", Provider::Gemini, &[Text, Vision], Some(1_048_576));
    insert("dryrun-text-1", Provider::Dryrun, &[Text, Vision], Some(8192));
    insert("dryrun-image-1", Provider::Dryrun, &[Image, Edit], None);

    map
}

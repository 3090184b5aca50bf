use std::env;
use std::time::Duration;

use anyhow::{bail, Result};
use folio_contracts::models::{Capability, ModelRegistry, ModelSelection, ModelSelector};
use folio_contracts::repository::DEFAULT_QUIET_PERIOD;
use folio_contracts::state::PromptPolicy;

use crate::dryrun::DryrunModel;
use crate::gemini::GeminiModel;
use crate::model::GenerativeModel;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_TIMEOUT_S: f64 = 90.0;
const MIN_TIMEOUT_S: f64 = 15.0;
const MAX_TIMEOUT_S: f64 = 300.0;

/// Runtime settings, read from the environment and then overridden by flags.
#[derive(Debug, Clone, PartialEq)]
pub struct FolioConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub text_model: Option<String>,
    pub image_model: Option<String>,
    pub request_timeout: Duration,
    pub sync_quiet: Duration,
    pub prompt_policy: PromptPolicy,
    pub dryrun: bool,
}

impl Default for FolioConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            text_model: None,
            image_model: None,
            request_timeout: Duration::from_secs_f64(DEFAULT_TIMEOUT_S),
            sync_quiet: DEFAULT_QUIET_PERIOD,
            prompt_policy: PromptPolicy::default(),
            dryrun: false,
        }
    }
}

/// Both model choices for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelChoice {
    pub text: ModelSelection,
    pub image: ModelSelection,
}

impl FolioConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(non_empty_env)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self {
            api_key: lookup("GEMINI_API_KEY").or_else(|| lookup("GOOGLE_API_KEY")),
            text_model: lookup("FOLIO_TEXT_MODEL"),
            image_model: lookup("FOLIO_IMAGE_MODEL"),
            ..Self::default()
        };
        if let Some(base) = lookup("GEMINI_API_BASE") {
            let base = base.trim_end_matches('/').to_string();
            if !base.is_empty() {
                config.api_base = base;
            }
        }
        if let Some(raw) = lookup("FOLIO_REQUEST_TIMEOUT") {
            match raw.parse::<f64>() {
                Ok(seconds) if seconds.is_finite() => {
                    config.request_timeout =
                        Duration::from_secs_f64(seconds.clamp(MIN_TIMEOUT_S, MAX_TIMEOUT_S));
                }
                _ => tracing::warn!(value = %raw, "ignoring invalid FOLIO_REQUEST_TIMEOUT"),
            }
        }
        if let Some(raw) = lookup("FOLIO_SYNC_QUIET_MS") {
            match raw.parse::<u64>() {
                Ok(millis) => config.sync_quiet = Duration::from_millis(millis),
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid FOLIO_SYNC_QUIET_MS"),
            }
        }
        if let Some(raw) = lookup("FOLIO_PROMPT_POLICY") {
            config.prompt_policy = raw.parse()?;
        }
        Ok(config)
    }

    pub fn registry(&self) -> ModelRegistry {
        if self.dryrun {
            ModelRegistry::dryrun()
        } else {
            ModelRegistry::default()
        }
    }

    /// Resolves the text (vision-capable) and image models, logging fallbacks.
    pub fn select_models(&self) -> Result<ModelChoice> {
        let selector = ModelSelector::new(self.registry());
        let text = selector
            .select(self.text_model.as_deref(), Capability::Vision)
            .map_err(anyhow::Error::msg)?;
        let image = selector
            .select(self.image_model.as_deref(), Capability::Image)
            .map_err(anyhow::Error::msg)?;
        for selection in [&text, &image] {
            if let (Some(reason), Some(_)) = (&selection.fallback_reason, &selection.requested) {
                tracing::warn!(model = %selection.model.name, "{reason}");
            }
        }
        if !image.model.supports(Capability::Edit) {
            tracing::warn!(model = %image.model.name, "image model does not support edits");
        }
        Ok(ModelChoice { text, image })
    }

    pub fn build_model(&self) -> Result<Box<dyn GenerativeModel>> {
        let choice = self.select_models()?;
        if self.dryrun {
            return Ok(Box::new(DryrunModel::new(
                choice.text.model.name,
                choice.image.model.name,
            )));
        }
        let Some(api_key) = self.api_key.clone() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set (use --dryrun to work offline)");
        };
        Ok(Box::new(GeminiModel::new(
            &self.api_base,
            api_key,
            choice.text.model.name,
            choice.image.model.name,
            self.request_timeout,
        )?))
    }
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub mod analyzer;
pub mod composer;
pub mod config;
pub mod dryrun;
pub mod filter;
pub mod gemini;
pub mod model;
pub mod request;
pub mod segmenter;
pub mod studio;

#[cfg(test)]
mod testing;

pub use config::FolioConfig;
pub use dryrun::DryrunModel;
pub use gemini::GeminiModel;
pub use model::{GenerativeModel, ImageRequest, JsonRequest, Part, TextRequest};
pub use studio::{BatchReport, GenerateOutcome, ReferenceOutcome, Studio};

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

use crate::analysis::AnalysisKind;

/// Coarse failure classes used when reporting an operation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Missing or malformed input, rejected before any network call.
    Validation,
    /// The model endpoint failed or answered with something unusable.
    ExternalCall,
    /// Broken image payloads or responses without an image.
    DataIntegrity,
    /// Illegal state for the requested operation.
    State,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FolioError {
    #[error("{0}")]
    Validation(String),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{kind} analysis failed: {message}")]
    Analysis { kind: AnalysisKind, message: String },

    #[error("scene segmentation failed: {0}")]
    Segmentation(String),

    #[error("image generation failed for scene '{scene_id}': {message}")]
    Generation { scene_id: String, message: String },

    #[error("image edit failed for scene '{scene_id}': {message}")]
    Edit { scene_id: String, message: String },

    #[error("{0}")]
    DataIntegrity(String),

    #[error("scene '{scene_id}' cannot {action} while {stage}")]
    InvalidTransition {
        scene_id: String,
        stage: String,
        action: String,
    },

    #[error("scene '{0}' is already generating")]
    AlreadyGenerating(String),

    #[error("deleting {entity} '{name}' discards its analysis; confirm to proceed")]
    ConfirmationRequired { entity: &'static str, name: String },
}

impl FolioError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn data_integrity(message: impl Into<String>) -> Self {
        Self::DataIntegrity(message.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) | Self::NotFound { .. } | Self::ConfirmationRequired { .. } => {
                ErrorCategory::Validation
            }
            Self::Analysis { .. }
            | Self::Segmentation(_)
            | Self::Generation { .. }
            | Self::Edit { .. } => ErrorCategory::ExternalCall,
            Self::DataIntegrity(_) => ErrorCategory::DataIntegrity,
            Self::InvalidTransition { .. } | Self::AlreadyGenerating(_) => ErrorCategory::State,
        }
    }
}

/// Finds the first [`FolioError`] in an `anyhow` chain.
pub fn folio_error(err: &anyhow::Error) -> Option<&FolioError> {
    err.chain().find_map(|cause| cause.downcast_ref::<FolioError>())
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn categories_follow_failure_taxonomy() {
        assert_eq!(
            FolioError::validation("no novel text").category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            FolioError::Segmentation("timeout".to_string()).category(),
            ErrorCategory::ExternalCall
        );
        assert_eq!(
            FolioError::data_integrity("bad data url").category(),
            ErrorCategory::DataIntegrity
        );
        assert_eq!(
            FolioError::AlreadyGenerating("s1".to_string()).category(),
            ErrorCategory::State
        );
    }

    #[test]
    fn folio_error_is_found_under_context_layers() {
        let err = Err::<(), _>(FolioError::not_found("scene", "s9"))
            .context("loading scene")
            .context("generate")
            .unwrap_err();
        assert_eq!(
            folio_error(&err),
            Some(&FolioError::not_found("scene", "s9"))
        );
        assert!(folio_error(&anyhow::anyhow!("plain")).is_none());
    }

    #[test]
    fn analysis_message_names_kind() {
        let err = FolioError::Analysis {
            kind: AnalysisKind::Background,
            message: "missing lighting".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "background analysis failed: missing lighting"
        );
    }
}

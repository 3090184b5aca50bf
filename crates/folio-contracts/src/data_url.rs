use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::FolioError;

/// An inline image, `data:<mime>;base64,<payload>`.
///
/// This is both the storage form of every image in a story and the
/// `inlineData` part sent to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
    mime_type: String,
    data: String,
}

impl DataUrl {
    pub fn from_bytes(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: BASE64.encode(bytes),
        }
    }

    /// Wraps an already base64-encoded payload, checking that it decodes.
    pub fn from_base64(
        mime_type: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<Self, FolioError> {
        let mime_type = mime_type.into();
        let data = data.into();
        if !mime_type.starts_with("image/") {
            return Err(FolioError::data_integrity(format!(
                "unsupported image mime type '{mime_type}'"
            )));
        }
        if data.is_empty() {
            return Err(FolioError::data_integrity("image payload is empty"));
        }
        BASE64
            .decode(data.as_bytes())
            .map_err(|err| FolioError::data_integrity(format!("invalid base64 payload: {err}")))?;
        Ok(Self { mime_type, data })
    }

    pub fn parse(raw: &str) -> Result<Self, FolioError> {
        let trimmed = raw.trim();
        let Some(rest) = trimmed.strip_prefix("data:") else {
            return Err(FolioError::data_integrity(
                "image is not a data URL (missing 'data:' prefix)",
            ));
        };
        let Some((header, payload)) = rest.split_once(',') else {
            return Err(FolioError::data_integrity(
                "data URL has no ',' separator",
            ));
        };
        let Some(mime_type) = header.strip_suffix(";base64") else {
            return Err(FolioError::data_integrity(
                "data URL is not base64 encoded",
            ));
        };
        Self::from_base64(mime_type, payload)
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn base64(&self) -> &str {
        &self.data
    }

    pub fn decode(&self) -> Result<Vec<u8>, FolioError> {
        BASE64
            .decode(self.data.as_bytes())
            .map_err(|err| FolioError::data_integrity(format!("invalid base64 payload: {err}")))
    }

    /// File extension matching the mime type.
    pub fn extension(&self) -> &'static str {
        let lowered = self.mime_type.to_ascii_lowercase();
        if lowered.contains("jpeg") || lowered.contains("jpg") {
            return "jpg";
        }
        if lowered.contains("webp") {
            return "webp";
        }
        if lowered.contains("gif") {
            return "gif";
        }
        "png"
    }
}

impl fmt::Display for DataUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "data:{};base64,{}", self.mime_type, self.data)
    }
}

impl FromStr for DataUrl {
    type Err = FolioError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

impl Serialize for DataUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DataUrl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Mime type for a file name, by extension.
pub fn mime_for_file_name(name: &str) -> Option<&'static str> {
    let ext = name.rsplit_once('.')?.1.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

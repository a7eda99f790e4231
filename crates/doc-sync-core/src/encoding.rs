//! Character encodings and construction-time document options.

use serde::Deserialize;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("Unsupported encoding: {0}")]
    Unsupported(String),

    #[error("Invalid {encoding} data: {message}")]
    Decode { encoding: Encoding, message: String },

    #[error("Character {0:?} cannot be represented in {1}")]
    Unencodable(char, Encoding),
}

/// Charset used to turn remote bytes into document text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Encoding {
    #[default]
    Utf8,
    Latin1,
}

impl Encoding {
    /// Decode bytes read from the remote store.
    pub fn decode(&self, bytes: &[u8]) -> Result<String, EncodingError> {
        match self {
            Encoding::Utf8 => String::from_utf8(bytes.to_vec()).map_err(|e| EncodingError::Decode {
                encoding: *self,
                message: e.to_string(),
            }),
            Encoding::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
        }
    }

    /// Encode document text for writing to the remote store.
    pub fn encode(&self, text: &str) -> Result<Vec<u8>, EncodingError> {
        match self {
            Encoding::Utf8 => Ok(text.as_bytes().to_vec()),
            Encoding::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).map_err(|_| EncodingError::Unencodable(c, *self)))
                .collect(),
        }
    }
}

impl Display for Encoding {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Utf8 => write!(f, "utf8"),
            Encoding::Latin1 => write!(f, "latin1"),
        }
    }
}

impl FromStr for Encoding {
    type Err = EncodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "latin1" | "latin-1" | "iso-8859-1" | "iso8859-1" => Ok(Encoding::Latin1),
            other => Err(EncodingError::Unsupported(other.to_string())),
        }
    }
}

impl<'de> Deserialize<'de> for Encoding {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// What happens to an unmodified document when its remote file is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeletePolicy {
    /// Destroy the document.
    #[default]
    Destroy,
    /// Keep the document but clear its remote binding.
    SoftDelete,
}

/// Options fixed when a document is constructed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DocumentOptions {
    pub encoding: Encoding,
    pub delete_policy: DeletePolicy,
}

//! Conversion request value objects.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Output format of a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Pdf,
    #[default]
    Png,
}

impl Format {
    /// File extension used for stored artifacts.
    pub fn extension(&self) -> &'static str {
        match self {
            Format::Pdf => "pdf",
            Format::Png => "png",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Format::Pdf => "application/pdf",
            Format::Png => "image/png",
        }
    }
}

/// Anything other than `pdf` falls back to PNG.
impl From<&str> for Format {
    fn from(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("pdf") {
            Format::Pdf
        } else {
            Format::Png
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// One conversion request.
///
/// Built once by the boundary layer and never mutated afterwards: the
/// builder methods consume `self`, and all fields are read through getters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionSource {
    uri: String,
    actual_uri: String,
    format: Format,
    aggressive: bool,
    wait_for_status: bool,
    upload_key: Option<String>,
}

impl ConversionSource {
    /// Creates a source whose display URI equals its location.
    pub fn new(uri: impl Into<String>, format: Format) -> Self {
        let uri = uri.into();
        Self {
            actual_uri: uri.clone(),
            uri,
            format,
            aggressive: false,
            wait_for_status: false,
            upload_key: None,
        }
    }

    /// Sets the display URI, e.g. the original filename of an uploaded page.
    pub fn with_actual_uri(mut self, actual_uri: impl Into<String>) -> Self {
        self.actual_uri = actual_uri.into();
        self
    }

    pub fn with_aggressive(mut self, aggressive: bool) -> Self {
        self.aggressive = aggressive;
        self
    }

    pub fn with_wait_for_status(mut self, wait_for_status: bool) -> Self {
        self.wait_for_status = wait_for_status;
        self
    }

    /// Sets the key under which a persisting backend stores the artifact.
    pub fn with_upload_key(mut self, key: impl Into<String>) -> Self {
        self.upload_key = Some(key.into());
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn actual_uri(&self) -> &str {
        &self.actual_uri
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn aggressive(&self) -> bool {
        self.aggressive
    }

    pub fn wait_for_status(&self) -> bool {
        self.wait_for_status
    }

    pub fn upload_key(&self) -> Option<&str> {
        self.upload_key.as_deref()
    }
}

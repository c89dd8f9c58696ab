use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

pub const MAX_ELEMENTS: usize = 200;
pub const MAX_WIDTH: u32 = 7680;
pub const MAX_HEIGHT: u32 = 4320;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Mp4,
    Webm,
    Mov,
    Gif,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Mp4 => write!(f, "mp4"),
            OutputFormat::Webm => write!(f, "webm"),
            OutputFormat::Mov => write!(f, "mov"),
            OutputFormat::Gif => write!(f, "gif"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Image,
    Video,
    Audio,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaElement {
    pub kind: ElementKind,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
}

impl MediaElement {
    pub fn new(kind: ElementKind, source: impl Into<String>) -> Self {
        Self {
            kind,
            source: source.into(),
            duration_secs: None,
        }
    }

    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = Some(secs);
        self
    }
}

/// A content-processing job as submitted by the request layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub output_format: OutputFormat,
    pub width: u32,
    pub height: u32,
    pub elements: Vec<MediaElement>,
    /// Caller identity, used by hash-based node selection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl JobRequest {
    pub fn new(output_format: OutputFormat, width: u32, height: u32) -> Self {
        Self {
            output_format,
            width,
            height,
            elements: Vec::new(),
            client_id: None,
        }
    }

    pub fn with_element(mut self, element: MediaElement) -> Self {
        self.elements.push(element);
        self
    }

    pub fn with_elements(mut self, kind: ElementKind, count: usize) -> Self {
        for i in 0..count {
            self.elements
                .push(MediaElement::new(kind, format!("{:?}-{}", kind, i).to_lowercase()));
        }
        self
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn has_video(&self) -> bool {
        self.elements.iter().any(|e| e.kind == ElementKind::Video)
    }

    /// Reject malformed requests before they reach analysis.
    pub fn validate(&self) -> Result<()> {
        if self.elements.is_empty() {
            return Err(OrchestratorError::Validation(
                "request has no elements".to_string(),
            ));
        }
        if self.elements.len() > MAX_ELEMENTS {
            return Err(OrchestratorError::Validation(format!(
                "request has {} elements, maximum is {}",
                self.elements.len(),
                MAX_ELEMENTS
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(OrchestratorError::Validation(
                "output dimensions must be non-zero".to_string(),
            ));
        }
        if self.width > MAX_WIDTH || self.height > MAX_HEIGHT {
            return Err(OrchestratorError::Validation(format!(
                "output {}x{} exceeds {}x{}",
                self.width, self.height, MAX_WIDTH, MAX_HEIGHT
            )));
        }
        for (i, element) in self.elements.iter().enumerate() {
            if element.source.trim().is_empty() {
                return Err(OrchestratorError::Validation(format!(
                    "element {} has an empty source",
                    i
                )));
            }
            if let Some(d) = element.duration_secs {
                if !d.is_finite() || d < 0.0 {
                    return Err(OrchestratorError::Validation(format!(
                        "element {} has invalid duration {}",
                        i, d
                    )));
                }
            }
        }
        Ok(())
    }
}

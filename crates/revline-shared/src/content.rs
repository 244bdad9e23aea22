//! Message body encoding.
//!
//! The `content` column holds either plain text or a JSON-encoded image
//! descriptor. Anything that does not parse as an image descriptor is text.

use serde::{Deserialize, Serialize};

use crate::constants::IMAGE_SUMMARY_TEXT;

/// Image attachment stored in a message body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageDescriptor {
    /// Always `"image"` on the wire.
    #[serde(rename = "type")]
    pub kind: String,
    /// Storage path; `None` while an optimistic upload is in flight.
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    pub mime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

impl ImageDescriptor {
    pub fn new(path: Option<String>, mime: impl Into<String>) -> Self {
        Self {
            kind: "image".to_string(),
            path,
            width: None,
            height: None,
            mime: mime.into(),
            caption: None,
        }
    }

    pub fn with_dimensions(mut self, width: Option<u32>, height: Option<u32>) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    Image(ImageDescriptor),
}

impl MessageContent {
    pub fn parse(raw: &str) -> Self {
        match serde_json::from_str::<ImageDescriptor>(raw) {
            Ok(image) if image.kind == "image" => MessageContent::Image(image),
            _ => MessageContent::Text(raw.to_string()),
        }
    }

    /// Encode for the `content` column.
    pub fn encode(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            // Serializing a plain struct of strings and integers cannot fail.
            MessageContent::Image(image) => serde_json::to_string(image).unwrap_or_default(),
        }
    }

    /// Short text shown in alerts.
    pub fn preview(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Image(image) => match image.caption.as_deref() {
                Some(caption) if !caption.is_empty() => format!("📷 {caption}"),
                _ => "📷 Image".to_string(),
            },
        }
    }

    /// Text stored as the conversation's `last_message_text`.
    pub fn summary(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Image(_) => IMAGE_SUMMARY_TEXT.to_string(),
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, MessageContent::Image(_))
    }
}

//! Heterogeneous runtime content and display-text extraction.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Block types that carry tool traffic rather than display text.
const TOOL_BLOCK_TYPES: &[&str] = &[
    "tool_use",
    "tool_call",
    "toolCall",
    "tool_result",
    "toolResult",
    "function_call",
];

/// Message content as produced by the agent runtime.
///
/// Producers are inconsistent: a plain string, an array of typed blocks,
/// or a single object carrying `text`, `value` or `delta` all occur in
/// the wild. [`Content::extract_text`] is the only place that probes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    /// Plain string.
    Text(String),
    /// Array of content blocks.
    Blocks(Vec<Block>),
    /// Single object with a text-bearing field.
    Fields(TextFields),
    /// Anything else (numbers, booleans). Never displayed.
    Other(Value),
}

/// One element of an array-shaped content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Block {
    /// Bare string element.
    Plain(String),
    /// Typed block, e.g. `{"type": "text", "text": "..."}`.
    Typed(TypedBlock),
    /// Unrecognized element.
    Other(Value),
}

/// A `{type, text}` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedBlock {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Object-shaped content; the first present field wins.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TextFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
}

impl Content {
    /// Extract normalized display text. Returns an empty string when the
    /// content carries nothing displayable.
    #[must_use]
    pub fn extract_text(&self) -> String {
        match self {
            Self::Text(s) => s.trim().to_string(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(Block::display_text)
                .filter(|s| !s.trim().is_empty())
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string(),
            Self::Fields(fields) => fields
                .text
                .as_deref()
                .or(fields.value.as_deref())
                .or(fields.delta.as_deref())
                .unwrap_or_default()
                .trim()
                .to_string(),
            Self::Other(_) => String::new(),
        }
    }

    /// True if every block is tool traffic (tool call or tool result).
    #[must_use]
    pub fn is_tool_traffic(&self) -> bool {
        match self {
            Self::Blocks(blocks) => !blocks.is_empty() && blocks.iter().all(Block::is_tool),
            _ => false,
        }
    }
}

impl Block {
    fn display_text(&self) -> Option<&str> {
        match self {
            Self::Plain(s) => Some(s),
            Self::Typed(block) => match block.kind.as_deref() {
                None | Some("text" | "output_text" | "input_text") => block.text.as_deref(),
                _ => None,
            },
            Self::Other(_) => None,
        }
    }

    fn is_tool(&self) -> bool {
        matches!(
            self,
            Self::Typed(TypedBlock { kind: Some(kind), .. }) if TOOL_BLOCK_TYPES.contains(&kind.as_str())
        )
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// Extract display text from optional content.
#[must_use]
pub fn extract_text(content: Option<&Content>) -> String {
    content.map(Content::extract_text).unwrap_or_default()
}

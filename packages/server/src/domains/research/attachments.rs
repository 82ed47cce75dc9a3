//! Attachments accepted by `submit_research`: images, text documents, and
//! structured data (CSV/JSON). Documents over the configured size limit are
//! rejected at validation time, before a job row is written.

use serde::{Deserialize, Serialize};

use crate::common::error::{ResearchError, Result};
use crate::common::hash::content_hash;

/// Image attachment, forwarded to vision-capable models.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ImageAttachment {
    pub url: String,
    /// "low", "high", or "auto"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Plain-text document attachment.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct TextDocument {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StructuredDataType {
    Csv,
    Json,
}

/// Structured-data attachment (CSV or JSON text).
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct StructuredDataAttachment {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: StructuredDataType,
    pub content: String,
}

/// Reject attachments over the provider size limit.
pub fn validate_attachments(
    text_documents: &[TextDocument],
    structured_data: &[StructuredDataAttachment],
    max_document_bytes: usize,
) -> Result<()> {
    for doc in text_documents {
        if doc.content.len() >= max_document_bytes {
            return Err(ResearchError::Validation(format!(
                "document '{}' is {} bytes, limit is {}",
                doc.name,
                doc.content.len(),
                max_document_bytes
            )));
        }
    }
    for data in structured_data {
        if data.content.len() >= max_document_bytes {
            return Err(ResearchError::Validation(format!(
                "structured data '{}' is {} bytes, limit is {}",
                data.name,
                data.content.len(),
                max_document_bytes
            )));
        }
    }
    Ok(())
}

/// Render attachments as a prompt context block. Long documents are
/// truncated; models get the head of each document plus its size.
pub fn attachment_context(
    text_documents: &[TextDocument],
    structured_data: &[StructuredDataAttachment],
    per_doc_chars: usize,
) -> Option<String> {
    if text_documents.is_empty() && structured_data.is_empty() {
        return None;
    }

    let mut block = String::from("Attached material:\n");
    for doc in text_documents {
        block.push_str(&format!(
            "\n--- document: {} ({} bytes) ---\n{}\n",
            doc.name,
            doc.content.len(),
            truncate(&doc.content, per_doc_chars)
        ));
    }
    for data in structured_data {
        let kind = match data.data_type {
            StructuredDataType::Csv => "csv",
            StructuredDataType::Json => "json",
        };
        block.push_str(&format!(
            "\n--- {} data: {} ({} bytes) ---\n{}\n",
            kind,
            data.name,
            data.content.len(),
            truncate(&data.content, per_doc_chars)
        ));
    }
    Some(block)
}

/// Compact summaries recorded in report metadata.
pub fn attachment_summaries(
    images: &[ImageAttachment],
    text_documents: &[TextDocument],
    structured_data: &[StructuredDataAttachment],
) -> serde_json::Value {
    serde_json::json!({
        "images": images.iter().map(|i| serde_json::json!({"url": i.url})).collect::<Vec<_>>(),
        "documents": text_documents
            .iter()
            .map(|d| serde_json::json!({
                "name": d.name,
                "bytes": d.content.len(),
                "contentHash": content_hash(&d.content),
            }))
            .collect::<Vec<_>>(),
        "structuredData": structured_data
            .iter()
            .map(|d| serde_json::json!({
                "name": d.name,
                "bytes": d.content.len(),
                "contentHash": content_hash(&d.content),
            }))
            .collect::<Vec<_>>(),
    })
}

/// Convert image attachments to the provider's content-part shape.
pub fn to_image_urls(images: &[ImageAttachment]) -> Vec<openrouter_client::ImageUrl> {
    images
        .iter()
        .map(|i| openrouter_client::ImageUrl {
            url: i.url.clone(),
            detail: i.detail.clone(),
        })
        .collect()
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(name: &str, content: &str) -> TextDocument {
        TextDocument {
            name: name.into(),
            content: content.into(),
        }
    }

    #[test]
    fn oversized_document_is_rejected() {
        let result = validate_attachments(&[doc("big.txt", &"x".repeat(100))], &[], 100);
        assert!(matches!(result, Err(ResearchError::Validation(_))));

        assert!(validate_attachments(&[doc("ok.txt", &"x".repeat(99))], &[], 100).is_ok());
    }

    #[test]
    fn oversized_structured_data_is_rejected() {
        let data = StructuredDataAttachment {
            name: "rows.csv".into(),
            data_type: StructuredDataType::Csv,
            content: "a,b\n".repeat(50),
        };
        let result = validate_attachments(&[], &[data], 10);
        assert!(matches!(result, Err(ResearchError::Validation(_))));
    }

    #[test]
    fn context_block_includes_documents() {
        let block = attachment_context(&[doc("notes.txt", "hello world")], &[], 100).unwrap();
        assert!(block.contains("notes.txt"));
        assert!(block.contains("hello world"));
    }

    #[test]
    fn no_attachments_means_no_context() {
        assert!(attachment_context(&[], &[], 100).is_none());
    }

    #[test]
    fn context_truncates_long_documents() {
        let block = attachment_context(&[doc("big.txt", &"ab".repeat(200))], &[], 10).unwrap();
        assert!(!block.contains(&"ab".repeat(100)));
    }

    #[test]
    fn summaries_hash_content() {
        let summary = attachment_summaries(&[], &[doc("a.txt", "content")], &[]);
        assert_eq!(summary["documents"][0]["name"], "a.txt");
        assert!(summary["documents"][0]["contentHash"]
            .as_str()
            .unwrap()
            .len()
            > 10);
    }

    #[test]
    fn structured_type_parses_lowercase() {
        let parsed: StructuredDataType = serde_json::from_str("\"csv\"").unwrap();
        assert_eq!(parsed, StructuredDataType::Csv);
    }
}

//! Value types for the research pipeline.

use serde::{Deserialize, Serialize};

use crate::common::error::Result;
use crate::common::hash::{content_hash, fingerprint};
use crate::kernel::gateway::CostPreference;

use super::attachments::{
    validate_attachments, ImageAttachment, StructuredDataAttachment, TextDocument,
};

/// Target audience for the synthesized report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudienceLevel {
    Beginner,
    #[default]
    Intermediate,
    Expert,
}

/// Shape of the synthesized output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Report,
    Briefing,
    BulletPoints,
}

/// Normalized parameters of one research job. This is what gets persisted
/// in the job row and fingerprinted for the semantic cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchParams {
    pub query: String,

    #[serde(default, alias = "cost_preference")]
    pub cost_preference: CostPreference,

    #[serde(default, alias = "audience_level")]
    pub audience_level: AudienceLevel,

    #[serde(default, alias = "output_format")]
    pub output_format: OutputFormat,

    #[serde(default = "default_true", alias = "include_sources")]
    pub include_sources: bool,

    #[serde(default, alias = "max_length", skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageAttachment>,

    #[serde(default, alias = "text_documents", skip_serializing_if = "Vec::is_empty")]
    pub text_documents: Vec<TextDocument>,

    #[serde(default, alias = "structured_data", skip_serializing_if = "Vec::is_empty")]
    pub structured_data: Vec<StructuredDataAttachment>,

    /// Deterministic sampling seed, forwarded to every provider call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl ResearchParams {
    /// Minimal params for a plain query.
    pub fn for_query(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            cost_preference: CostPreference::default(),
            audience_level: AudienceLevel::default(),
            output_format: OutputFormat::default(),
            include_sources: true,
            max_length: None,
            images: Vec::new(),
            text_documents: Vec::new(),
            structured_data: Vec::new(),
            seed: None,
        }
    }

    /// Required-field and attachment-size validation.
    pub fn validate(&self, max_document_bytes: usize) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(crate::common::error::ResearchError::Validation(
                "query must not be empty".into(),
            ));
        }
        validate_attachments(
            &self.text_documents,
            &self.structured_data,
            max_document_bytes,
        )
    }

    /// Stable fingerprint over the normalized params. Attachment contents
    /// contribute through their hashes so the fingerprint stays short while
    /// still changing whenever an attachment changes.
    pub fn fingerprint(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or_default();

        if let Some(docs) = value.get_mut("textDocuments").and_then(|v| v.as_array_mut()) {
            for doc in docs {
                if let Some(content) = doc.get("content").and_then(|c| c.as_str()) {
                    let hash = content_hash(content);
                    doc["content"] = serde_json::Value::String(hash);
                }
            }
        }
        if let Some(data) = value.get_mut("structuredData").and_then(|v| v.as_array_mut()) {
            for item in data {
                if let Some(content) = item.get("content").and_then(|c| c.as_str()) {
                    let hash = content_hash(content);
                    item["content"] = serde_json::Value::String(hash);
                }
            }
        }

        fingerprint(&value)
    }
}

/// One decomposed research question assigned to one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubQuery {
    pub agent_id: String,
    pub query: String,
    pub role: String,
    /// Planner-pinned model, overriding tier selection.
    pub model: Option<String>,
    /// Issue a small model ensemble for this sub-query.
    pub ensemble: bool,
}

/// Result record for one sub-query. Failures stay inside the ensemble as
/// error records instead of aborting the iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_id: String,
    pub query: String,
    pub model: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub sources: Vec<String>,
}

impl AgentResult {
    pub fn ok(&self) -> bool {
        self.error.is_none() && self.result.is_some()
    }

    pub fn failed(sub_query: &SubQuery, error: impl std::fmt::Display) -> Self {
        Self {
            agent_id: sub_query.agent_id.clone(),
            query: sub_query.query.clone(),
            model: sub_query.model.clone().unwrap_or_default(),
            result: None,
            error: Some(error.to_string()),
            sources: Vec::new(),
        }
    }
}

/// Collect `[Source: URL]` citations appearing verbatim in model output.
pub fn extract_sources(text: &str) -> Vec<String> {
    let mut sources = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("[Source:") {
        rest = &rest[start + "[Source:".len()..];
        if let Some(end) = rest.find(']') {
            let source = rest[..end].trim().to_string();
            if !source.is_empty() && !sources.contains(&source) {
                sources.push(source);
            }
            rest = &rest[end + 1..];
        } else {
            break;
        }
    }
    sources
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_accept_camel_and_snake_case() {
        let camel: ResearchParams = serde_json::from_value(json!({
            "query": "q",
            "costPreference": "high",
            "audienceLevel": "expert",
            "outputFormat": "bullet_points",
        }))
        .unwrap();
        assert_eq!(camel.cost_preference, CostPreference::High);
        assert_eq!(camel.audience_level, AudienceLevel::Expert);
        assert_eq!(camel.output_format, OutputFormat::BulletPoints);

        let snake: ResearchParams = serde_json::from_value(json!({
            "query": "q",
            "cost_preference": "high",
            "audience_level": "expert",
            "output_format": "bullet_points",
        }))
        .unwrap();
        assert_eq!(snake.cost_preference, CostPreference::High);
        assert_eq!(snake.audience_level, AudienceLevel::Expert);
    }

    #[test]
    fn params_default_fill() {
        let params: ResearchParams = serde_json::from_value(json!({"query": "q"})).unwrap();
        assert_eq!(params.cost_preference, CostPreference::Low);
        assert_eq!(params.audience_level, AudienceLevel::Intermediate);
        assert_eq!(params.output_format, OutputFormat::Report);
        assert!(params.include_sources);
        assert!(params.images.is_empty());
    }

    #[test]
    fn empty_query_fails_validation() {
        let params = ResearchParams::for_query("   ");
        assert!(params.validate(1024).is_err());
    }

    #[test]
    fn fingerprint_is_stable_across_key_order() {
        let a: ResearchParams =
            serde_json::from_value(json!({"query": "q", "costPreference": "low"})).unwrap();
        let b: ResearchParams =
            serde_json::from_value(json!({"costPreference": "low", "query": "q"})).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_document_content() {
        let mut a = ResearchParams::for_query("q");
        a.text_documents.push(TextDocument {
            name: "d".into(),
            content: "one".into(),
        });
        let mut b = ResearchParams::for_query("q");
        b.text_documents.push(TextDocument {
            name: "d".into(),
            content: "two".into(),
        });
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_ignores_cost_changes_only_when_equal() {
        let low = ResearchParams::for_query("q");
        let mut high = ResearchParams::for_query("q");
        high.cost_preference = CostPreference::High;
        assert_ne!(low.fingerprint(), high.fingerprint());
    }

    #[test]
    fn extracts_verbatim_sources() {
        let text = "Paris is the capital [Source: https://a.example] and \
                    [Source: https://b.example]. Repeated [Source: https://a.example].";
        assert_eq!(
            extract_sources(text),
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
    }

    #[test]
    fn extract_sources_handles_no_citations() {
        assert!(extract_sources("no citations here").is_empty());
    }
}

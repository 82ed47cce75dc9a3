//! Typed argument structs for the public tool surface.
//!
//! The tool protocol hands us untyped JSON maps; each tool gets a tagged
//! variant here with alias expansion (camelCase and snake_case both
//! accepted), default filling, and required-field validation. Anything that
//! does not parse becomes a `ValidationError` before any job state is
//! touched.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use uuid::Uuid;

use crate::common::error::{ResearchError, Result};
use crate::domains::research::models::ResearchParams;
use crate::kernel::kb::SearchScope;

/// Parse a tool's argument map into its typed variant.
pub fn parse_args<T: DeserializeOwned>(args: serde_json::Value) -> Result<T> {
    serde_json::from_value(args)
        .map_err(|e| ResearchError::Validation(format!("invalid arguments: {}", e)))
}

// =============================================================================
// submit_research
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct SubmitResearchArgs {
    #[serde(flatten)]
    pub params: ResearchParams,

    #[serde(default, rename = "idempotencyKey", alias = "idempotency_key")]
    pub idempotency_key: Option<String>,

    #[serde(default, rename = "forceNew", alias = "force_new")]
    pub force_new: bool,

    /// Opaque transport token routed back on progress notifications.
    #[serde(default, rename = "progressToken", alias = "progress_token")]
    pub progress_token: Option<String>,
}

// =============================================================================
// job_status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFormat {
    #[default]
    Summary,
    Full,
    Events,
}

#[derive(Debug, Deserialize)]
pub struct JobStatusArgs {
    #[serde(rename = "jobId", alias = "job_id")]
    pub job_id: Uuid,

    #[serde(default)]
    pub format: StatusFormat,

    #[serde(default = "default_max_events", rename = "maxEvents", alias = "max_events")]
    pub max_events: i64,

    #[serde(default, rename = "sinceSeq", alias = "since_seq")]
    pub since_seq: Option<i64>,
}

fn default_max_events() -> i64 {
    50
}

// =============================================================================
// cancel_job
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CancelJobArgs {
    #[serde(rename = "jobId", alias = "job_id")]
    pub job_id: Uuid,
}

// =============================================================================
// get_report
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportMode {
    #[default]
    Full,
    Summary,
    Truncate,
}

#[derive(Debug, Deserialize)]
pub struct GetReportArgs {
    #[serde(rename = "reportId", alias = "report_id")]
    pub report_id: String,

    #[serde(default)]
    pub mode: ReportMode,
}

// =============================================================================
// search
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchScopeArg {
    #[default]
    Both,
    Reports,
    Docs,
}

impl From<SearchScopeArg> for SearchScope {
    fn from(arg: SearchScopeArg) -> Self {
        match arg {
            SearchScopeArg::Both => SearchScope::Both,
            SearchScopeArg::Reports => SearchScope::Reports,
            SearchScopeArg::Docs => SearchScope::Docs,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchArgs {
    pub query: String,

    #[serde(default = "default_search_limit")]
    pub limit: i64,

    #[serde(default)]
    pub scope: SearchScopeArg,
}

fn default_search_limit() -> i64 {
    10
}

// =============================================================================
// rate_report
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct RateReportArgs {
    #[serde(rename = "reportId", alias = "report_id")]
    pub report_id: String,

    pub rating: i64,

    #[serde(default)]
    pub comment: Option<String>,
}

// =============================================================================
// list_reports
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ListReportsArgs {
    #[serde(default = "default_search_limit")]
    pub limit: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::gateway::CostPreference;
    use serde_json::json;

    #[test]
    fn submit_args_fill_defaults() {
        let args: SubmitResearchArgs =
            parse_args(json!({"query": "what is rust?"})).unwrap();
        assert_eq!(args.params.query, "what is rust?");
        assert_eq!(args.params.cost_preference, CostPreference::Low);
        assert!(args.params.include_sources);
        assert!(!args.force_new);
        assert!(args.idempotency_key.is_none());
    }

    #[test]
    fn submit_args_missing_query_is_validation_error() {
        let result: Result<SubmitResearchArgs> = parse_args(json!({"costPreference": "low"}));
        assert!(matches!(result, Err(ResearchError::Validation(_))));
    }

    #[test]
    fn submit_args_accept_snake_case_aliases() {
        let args: SubmitResearchArgs = parse_args(json!({
            "query": "q",
            "idempotency_key": "k1",
            "force_new": true,
        }))
        .unwrap();
        assert_eq!(args.idempotency_key.as_deref(), Some("k1"));
        assert!(args.force_new);
    }

    #[test]
    fn job_status_args_defaults() {
        let id = Uuid::new_v4();
        let args: JobStatusArgs = parse_args(json!({"jobId": id.to_string()})).unwrap();
        assert_eq!(args.job_id, id);
        assert_eq!(args.format, StatusFormat::Summary);
        assert_eq!(args.max_events, 50);
        assert!(args.since_seq.is_none());
    }

    #[test]
    fn job_status_args_reject_bad_uuid() {
        let result: Result<JobStatusArgs> = parse_args(json!({"jobId": "not-a-uuid"}));
        assert!(matches!(result, Err(ResearchError::Validation(_))));
    }

    #[test]
    fn search_args_defaults_and_scope() {
        let args: SearchArgs = parse_args(json!({"query": "rust"})).unwrap();
        assert_eq!(args.limit, 10);
        assert_eq!(args.scope, SearchScopeArg::Both);

        let args: SearchArgs =
            parse_args(json!({"query": "rust", "scope": "reports", "limit": 3})).unwrap();
        assert_eq!(SearchScope::from(args.scope), SearchScope::Reports);
        assert_eq!(args.limit, 3);
    }

    #[test]
    fn report_mode_parses() {
        let args: GetReportArgs =
            parse_args(json!({"reportId": "r1", "mode": "truncate"})).unwrap();
        assert_eq!(args.mode, ReportMode::Truncate);
    }

    #[test]
    fn unknown_extra_fields_are_tolerated() {
        let args: CancelJobArgs = parse_args(json!({
            "jobId": Uuid::new_v4().to_string(),
            "_meta": {"progressToken": "t"},
        }))
        .unwrap();
        let _ = args;
    }
}

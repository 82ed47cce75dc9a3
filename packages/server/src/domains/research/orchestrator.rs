//! Research orchestrator: cache probe -> past-report lookup -> iterative
//! planning/research -> streamed synthesis -> persist.
//!
//! Event ordering per job: one `phase_started:planning` /
//! `phase_complete:planning` pair, one researching pair wrapping every
//! research round (refinement included), N `agent_progress` events (one per
//! sub-query), then the synthesizing pair with at least one
//! `synthesis_chunk`. Cancellation is observed between pipeline steps,
//! before provider calls, between sub-query completions, and between
//! synthesis chunks.

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::common::error::{ResearchError, Result};
use crate::kernel::cache::{CacheEntry, CachedReport};
use crate::kernel::jobs::{JobEvent, JobManager, Phase};
use crate::kernel::kb::{DocIndexEntry, NewReport};
use crate::kernel::ResearchKernel;

use super::attachments::attachment_summaries;
use super::models::{AgentResult, ResearchParams, SubQuery};
use super::planner;
use super::researcher;
use super::synthesizer;

/// Run the pipeline for one leased job. Returns the persisted report id.
pub async fn run(
    kernel: &ResearchKernel,
    job_id: Uuid,
    params: ResearchParams,
    progress_token: Option<&str>,
    cancel: &CancellationToken,
) -> Result<String> {
    let started = std::time::Instant::now();
    let emitter = Emitter {
        jobs: kernel.jobs.as_ref(),
        job_id,
        progress_token,
        last_percent: std::sync::atomic::AtomicU8::new(0),
    };

    params.validate(kernel.config.max_document_bytes)?;
    ensure_live(cancel)?;

    // ------------------------------------------------------------------
    // 1. Cache probe: exact fingerprint, then nearest neighbor.
    // ------------------------------------------------------------------
    let fingerprint = params.fingerprint();
    if let Some(hit) = kernel.cache.lookup_exact(&fingerprint) {
        info!(job_id = %job_id, report_id = %hit.report_id, "exact cache hit");
        emitter
            .emit(JobEvent::CacheHit {
                report_id: hit.report_id.clone(),
            })
            .await?;
        return Ok(hit.report_id);
    }

    let query_embedding = match kernel.gateway.embed(&params.query, cancel).await {
        Ok(embedding) => Some(embedding),
        Err(ResearchError::Cancelled) => return Err(ResearchError::Cancelled),
        Err(e) => {
            // Retrieval degrades gracefully; research itself can continue.
            warn!(job_id = %job_id, error = %e, "query embedding failed, skipping similarity probes");
            None
        }
    };

    if let Some(embedding) = &query_embedding {
        if let Some((hit, similarity)) = kernel.cache.lookup_similar(embedding) {
            info!(job_id = %job_id, report_id = %hit.report_id, similarity, "semantic cache hit");
            emitter
                .emit(JobEvent::CacheHit {
                    report_id: hit.report_id.clone(),
                })
                .await?;
            return Ok(hit.report_id);
        }
    }

    emitter.progress(5, "starting research pipeline").await?;
    ensure_live(cancel)?;

    // ------------------------------------------------------------------
    // 2. Past-report lookup: advisory context for the planner.
    // ------------------------------------------------------------------
    let mut based_on_report_ids = Vec::new();
    let mut past_context = None;
    if let Some(embedding) = &query_embedding {
        let similar = kernel
            .kb
            .find_reports_by_similarity(
                embedding,
                3,
                kernel.config.past_report_sim_floor,
            )
            .await?;
        if !similar.is_empty() {
            let mut context = String::new();
            for (report, similarity) in &similar {
                based_on_report_ids.push(report.id.clone());
                let head: String = report.content.chars().take(500).collect();
                context.push_str(&format!(
                    "- prior report ({:.2} similar) on \"{}\": {}\n",
                    similarity, report.query, head
                ));
            }
            debug!(job_id = %job_id, count = similar.len(), "found related past reports");
            past_context = Some(context);
        }
    }

    // ------------------------------------------------------------------
    // 3. Planning (first round).
    // ------------------------------------------------------------------
    emitter
        .emit(JobEvent::PhaseStarted {
            phase: Phase::Planning,
        })
        .await?;

    let first_round = planner::plan(
        &kernel.gateway,
        &params,
        past_context.as_deref(),
        &[],
        1,
        cancel,
    )
    .await?;

    if first_round.sub_queries.is_empty() {
        return Err(ResearchError::PlanParse(
            "planner produced an empty plan".into(),
        ));
    }

    emitter
        .emit(JobEvent::PhaseComplete {
            phase: Phase::Planning,
        })
        .await?;
    emitter.progress(10, "plan ready").await?;

    // ------------------------------------------------------------------
    // 4. Research rounds (with refinement planning between them).
    // ------------------------------------------------------------------
    emitter
        .emit(JobEvent::PhaseStarted {
            phase: Phase::Researching,
        })
        .await?;

    let mut all_results: Vec<AgentResult> = Vec::new();
    let mut round_queries = first_round.sub_queries;
    let mut coverage_complete = first_round.complete;
    let mut planned_total = round_queries.len();

    for iteration in 1..=kernel.config.max_iterations {
        run_round(
            kernel,
            &emitter,
            &params,
            std::mem::take(&mut round_queries),
            planned_total,
            &mut all_results,
            cancel,
        )
        .await?;

        if coverage_complete || iteration >= kernel.config.max_iterations {
            break;
        }

        ensure_live(cancel)?;
        match planner::plan(
            &kernel.gateway,
            &params,
            past_context.as_deref(),
            &all_results,
            iteration + 1,
            cancel,
        )
        .await
        {
            Ok(refined) => {
                if refined.sub_queries.is_empty() {
                    // Refinement found no gaps; proceed to synthesis.
                    break;
                }
                planned_total += refined.sub_queries.len();
                round_queries = refined.sub_queries;
                coverage_complete = refined.complete;
            }
            Err(ResearchError::Cancelled) => return Err(ResearchError::Cancelled),
            Err(e) => {
                // A broken refinement round ends the loop, it does not kill
                // the job: the first round's ensemble is still usable.
                warn!(job_id = %job_id, error = %e, "refinement planning failed, synthesizing what we have");
                break;
            }
        }
    }

    if !all_results.iter().any(|r| r.ok()) {
        return Err(ResearchError::NoResults);
    }

    emitter
        .emit(JobEvent::PhaseComplete {
            phase: Phase::Researching,
        })
        .await?;
    emitter.progress(70, "research rounds complete").await?;

    // ------------------------------------------------------------------
    // 5. Synthesis (streamed).
    // ------------------------------------------------------------------
    ensure_live(cancel)?;
    emitter
        .emit(JobEvent::PhaseStarted {
            phase: Phase::Synthesizing,
        })
        .await?;

    let (synthesis_model, mut stream) =
        synthesizer::open_stream(&kernel.gateway, &params, &all_results, cancel).await?;

    let mut content = String::new();
    let mut tokens_generated: u64 = 0;
    while let Some(chunk) = stream.next().await {
        ensure_live(cancel)?;
        let chunk = chunk.map_err(ResearchError::from)?;
        if chunk.done {
            break;
        }
        if chunk.delta.is_empty() {
            continue;
        }
        tokens_generated += chunk.delta.split_whitespace().count().max(1) as u64;
        content.push_str(&chunk.delta);
        emitter
            .emit(JobEvent::SynthesisChunk {
                content: chunk.delta,
                tokens_generated,
            })
            .await?;
    }

    if content.trim().is_empty() {
        return Err(ResearchError::ProviderPermanent(
            "synthesis produced no content".into(),
        ));
    }

    // Append a sources section when requested and not already present.
    if params.include_sources && !content.contains("## Sources") {
        let sources = synthesizer::collect_sources(&all_results);
        if !sources.is_empty() {
            let mut section = String::from("\n\n## Sources\n");
            for source in &sources {
                section.push_str(&format!("- {}\n", source));
            }
            tokens_generated += section.split_whitespace().count() as u64;
            content.push_str(&section);
            emitter
                .emit(JobEvent::SynthesisChunk {
                    content: section,
                    tokens_generated,
                })
                .await?;
        }
    }

    emitter
        .emit(JobEvent::PhaseComplete {
            phase: Phase::Synthesizing,
        })
        .await?;
    emitter.progress(90, "synthesis complete").await?;

    // ------------------------------------------------------------------
    // 6. Persist report + index, then the semantic cache.
    // ------------------------------------------------------------------
    ensure_live(cancel)?;

    let successful = all_results.iter().filter(|r| r.ok()).count();
    let metadata = serde_json::json!({
        "durationMs": started.elapsed().as_millis() as u64,
        "subQueryCount": all_results.len(),
        "successfulSubQueries": successful,
        "synthesisModel": synthesis_model,
        "models": all_results.iter().map(|r| r.model.clone()).collect::<Vec<_>>(),
        "attachments": attachment_summaries(&params.images, &params.text_documents, &params.structured_data),
    });

    let content_embedding = {
        let head: String = content.chars().take(6000).collect();
        match kernel.gateway.embed(&head, cancel).await {
            Ok(embedding) => Some(embedding),
            Err(ResearchError::Cancelled) => return Err(ResearchError::Cancelled),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "report embedding failed, indexing without vector");
                query_embedding.clone()
            }
        }
    };

    let mut index_entries = vec![DocIndexEntry {
        source_type: "report".to_string(),
        title: Some(params.query.clone()),
        content: content.clone(),
        embedding: content_embedding,
    }];
    for doc in &params.text_documents {
        index_entries.push(DocIndexEntry {
            source_type: "document".to_string(),
            title: Some(doc.name.clone()),
            content: doc.content.clone(),
            embedding: None,
        });
    }

    let report_id = kernel
        .kb
        .save_report(
            NewReport {
                query: params.query.clone(),
                parameters: serde_json::to_value(&params)?,
                content: content.clone(),
                metadata,
                based_on_report_ids,
            },
            index_entries,
        )
        .await?;

    let cached = CachedReport {
        report_id: report_id.clone(),
        content,
    };
    let entry = CacheEntry {
        key: fingerprint.clone(),
        query_embedding: query_embedding.unwrap_or_default(),
        value: cached.clone(),
        inserted_at: chrono::Utc::now(),
    };
    let evicted = kernel
        .cache
        .insert(fingerprint, entry.query_embedding.clone(), cached);
    if let Err(e) = kernel.kb.persist_cache_entry(&entry).await {
        warn!(job_id = %job_id, error = %e, "cache write-through failed");
    }
    if let Err(e) = kernel.kb.delete_cache_entries(&evicted).await {
        warn!(job_id = %job_id, error = %e, "evicted cache cleanup failed");
    }

    emitter.progress(95, "report persisted").await?;
    info!(job_id = %job_id, report_id = %report_id, "research complete");
    Ok(report_id)
}

/// Fan one round of sub-queries through the bounded executor, appending
/// results (successes and error records) as they complete.
async fn run_round(
    kernel: &ResearchKernel,
    emitter: &Emitter<'_>,
    params: &ResearchParams,
    round_queries: Vec<SubQuery>,
    planned_total: usize,
    all_results: &mut Vec<AgentResult>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut in_flight = FuturesUnordered::new();
    for sub_query in round_queries {
        let cancel = cancel.clone();
        in_flight.push(async move {
            let outcome = kernel
                .executor
                .run(
                    &cancel,
                    researcher::run_sub_query(&kernel.gateway, &sub_query, params, &cancel),
                )
                .await;
            (sub_query, outcome)
        });
    }

    while let Some((sub_query, outcome)) = in_flight.next().await {
        ensure_live(cancel)?;
        let result = match outcome {
            Ok(result) => result,
            Err(ResearchError::Cancelled) => return Err(ResearchError::Cancelled),
            Err(e) => AgentResult::failed(&sub_query, e),
        };

        let agent_id = result.agent_id.clone();
        let ok = result.ok();
        all_results.push(result);
        let completed = all_results.len();
        emitter
            .emit(JobEvent::AgentProgress {
                current: completed as u32,
                total: planned_total.max(completed) as u32,
                agent_id,
                ok,
            })
            .await?;

        let percent = 15 + (50 * completed / planned_total.max(completed)).min(50) as u8;
        emitter
            .progress(percent, &format!("{}/{} sub-queries done", completed, planned_total))
            .await?;
    }

    Ok(())
}

fn ensure_live(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(ResearchError::Cancelled)
    } else {
        Ok(())
    }
}

/// Thin handle binding events to one job and its progress token.
struct Emitter<'a> {
    jobs: &'a JobManager,
    job_id: Uuid,
    progress_token: Option<&'a str>,
    last_percent: std::sync::atomic::AtomicU8,
}

impl Emitter<'_> {
    async fn emit(&self, event: JobEvent) -> Result<()> {
        self.jobs
            .emit(self.job_id, event, self.progress_token)
            .await?;
        Ok(())
    }

    /// Emit a progress event. Percent is clamped to be non-decreasing: a
    /// refinement round can grow the planned-work denominator, which would
    /// otherwise walk the raw percentage backwards.
    async fn progress(&self, percent: u8, message: &str) -> Result<()> {
        let previous = self
            .last_percent
            .fetch_max(percent, std::sync::atomic::Ordering::SeqCst);
        self.emit(JobEvent::Progress {
            percent: previous.max(percent),
            message: message.to_string(),
        })
        .await
    }
}

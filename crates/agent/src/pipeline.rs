//! The answering pipeline: route, retrieve, reconcile, reason, assemble.
//!
//! One `ask` call runs the full path: the router picks partitions, the
//! fan-out searches them, the conflict resolver reconciles overlapping
//! results when more than one partition was hit, and the reasoning loop
//! turns the reconciled context into an answer.

use std::sync::Arc;
use std::time::Instant;

use arbiter_config::AppConfig;
use arbiter_core::error::Error;
use arbiter_core::event::{DomainEvent, EventBus};
use arbiter_core::history::HistoryStore;
use arbiter_core::message::{Message, SessionId, Transcript};
use arbiter_core::provider::Usage;
use arbiter_core::retrieval::{PartitionClient, RetrievalHit};
use arbiter_retrieval::{
    ConflictReport, ConflictResolver, QueryRouter, QuerySignals, Route, search_partitions,
};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::loop_runner::ReasoningLoop;
use crate::state::{AgentState, AgentStep};
use crate::stream_event::AnswerStreamEvent;

/// Caller-supplied options for one query.
#[derive(Default)]
pub struct AskOptions {
    /// Routing hints
    pub signals: QuerySignals,

    /// Resume an existing session
    pub session_id: Option<String>,

    /// Prior messages supplied directly. Preferred over the history
    /// store: the pipeline then works even when the store is down.
    pub history: Vec<Message>,
}

/// The assembled answer for one query.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    /// The final answer text
    pub answer: String,

    /// Session this answer belongs to
    pub session_id: String,

    /// The reconciled retrieval hits the answer was grounded on
    pub sources: Vec<RetrievalHit>,

    /// Conflicts detected and resolved during retrieval
    pub conflicts: Vec<ConflictReport>,

    /// Partitions that were unavailable (degraded, not fatal)
    pub failed_partitions: Vec<String>,

    /// The routing decision
    pub route: Route,

    /// Completed reasoning steps
    pub steps: Vec<AgentStep>,

    /// Iterations the loop consumed
    pub iterations: u32,

    /// Aggregate token usage
    pub usage: Option<Usage>,

    /// The model that answered
    pub model: String,

    /// Total transcript length in characters
    pub context_length: usize,

    /// Wall-clock time for the whole pipeline
    pub execution_time_ms: u64,
}

/// The full answering pipeline.
pub struct AnswerPipeline {
    partitions: Arc<dyn PartitionClient>,
    router: QueryRouter,
    resolver: ConflictResolver,
    runner: Arc<ReasoningLoop>,
    history: Option<Arc<dyn HistoryStore>>,
    event_bus: Arc<EventBus>,
    top_k: usize,
}

impl AnswerPipeline {
    pub fn new(
        config: &AppConfig,
        partitions: Arc<dyn PartitionClient>,
        runner: Arc<ReasoningLoop>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            partitions,
            router: QueryRouter::new(config.routing.clone()),
            resolver: ConflictResolver::new(config.conflicts.clone()),
            runner,
            history: None,
            event_bus,
            top_k: config.routing.top_k,
        }
    }

    /// Attach a history store for session resumption.
    pub fn with_history_store(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(store);
        self
    }

    /// Answer a query, buffered.
    pub async fn ask(&self, query: &str, options: AskOptions) -> Result<Answer, Error> {
        let started = Instant::now();

        let retrieved = self.retrieve(query, &options.signals).await;
        let transcript = self.transcript_for(&options).await;

        let mut state = AgentState::new(query, transcript);
        let run = self.runner.run(&mut state, &retrieved.hits).await?;

        let answer = Answer {
            answer: run.answer,
            session_id: state.transcript.id.to_string(),
            sources: retrieved.hits,
            conflicts: retrieved.conflicts,
            failed_partitions: retrieved.failed,
            route: retrieved.route,
            steps: state.steps,
            iterations: state.iteration,
            usage: run.usage,
            model: run.model,
            context_length: state.transcript.context_length(),
            execution_time_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            session_id = %answer.session_id,
            strategy = answer.route.strategy.as_str(),
            sources = answer.sources.len(),
            conflicts = answer.conflicts.len(),
            elapsed_ms = answer.execution_time_ms,
            "Query answered"
        );
        Ok(answer)
    }

    /// Answer a query, streaming.
    ///
    /// Retrieval runs before the stream opens; the returned receiver
    /// yields zero or more `Chunk`s and exactly one terminator.
    pub async fn ask_stream(
        &self,
        query: &str,
        options: AskOptions,
    ) -> mpsc::Receiver<AnswerStreamEvent> {
        let retrieved = self.retrieve(query, &options.signals).await;
        let transcript = self.transcript_for(&options).await;
        let state = AgentState::new(query, transcript);
        self.runner.clone().run_stream(state, retrieved.hits)
    }

    /// Route the query and produce the reconciled hit set.
    ///
    /// The resolver only runs when the route spans at least two
    /// partitions; a single-partition route can never conflict.
    async fn retrieve(&self, query: &str, signals: &QuerySignals) -> Retrieved {
        let route = self.router.route(query, signals);
        self.event_bus.publish(DomainEvent::QueryRouted {
            strategy: route.strategy.as_str().to_string(),
            partitions: route.partitions.clone(),
            timestamp: Utc::now(),
        });

        let pool =
            search_partitions(self.partitions.clone(), &route.partitions, query, self.top_k)
                .await;
        let failed: Vec<String> = pool.failed.iter().map(|(p, _)| p.clone()).collect();

        let (hits, conflicts) = if route.partitions.len() >= 2 {
            let reports = self.resolver.detect(&pool.by_partition);
            let (hits, reports) = self.resolver.resolve(&pool.by_partition, reports);
            for report in &reports {
                self.event_bus.publish(DomainEvent::ConflictResolved {
                    partition_a: report.partition_a.clone(),
                    partition_b: report.partition_b.clone(),
                    winner: report.winner_partition.clone(),
                    kind: report.kind.as_str().to_string(),
                    timestamp: Utc::now(),
                });
            }
            (hits, reports)
        } else {
            let mut hits: Vec<RetrievalHit> =
                pool.by_partition.into_values().flatten().collect();
            hits.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            (hits, Vec::new())
        };

        Retrieved {
            route,
            hits,
            conflicts,
            failed,
        }
    }

    /// Build the starting transcript: supplied history first, then the
    /// store, then fresh.
    async fn transcript_for(&self, options: &AskOptions) -> Transcript {
        let session_id = options
            .session_id
            .as_deref()
            .map(SessionId::from)
            .unwrap_or_default();

        if !options.history.is_empty() {
            return Transcript::with_history(session_id, options.history.clone());
        }

        if let (Some(store), Some(id)) = (&self.history, &options.session_id) {
            match store.get_history(id).await {
                Ok(history) => return Transcript::with_history(session_id, history),
                Err(e) => {
                    warn!(session_id = %id, error = %e, "History unavailable, starting fresh");
                }
            }
        }

        Transcript::with_history(session_id, Vec::new())
    }
}

struct Retrieved {
    route: Route,
    hits: Vec<RetrievalHit>,
    conflicts: Vec<ConflictReport>,
    failed: Vec<String>,
}

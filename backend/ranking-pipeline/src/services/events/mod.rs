// ============================================
// Event accumulation
// ============================================
// Stages append audit-trail events to a request-scoped collector. The
// collector is cheap to clone and safe to append from concurrent tasks.

use crate::models::ScoredCandidate;
use async_trait::async_trait;
use chrono::Utc;
use event_schema::{CandidateEventData, EventData, ImpressionEventData, LoggedEvent};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// Append-only event list for one in-flight request
#[derive(Debug, Clone)]
pub struct EventCollector {
    request_id: Arc<str>,
    api_source: Arc<str>,
    events: Arc<Mutex<Vec<LoggedEvent>>>,
}

impl EventCollector {
    pub fn new(request_id: &str, api_source: &str) -> Self {
        Self {
            request_id: Arc::from(request_id),
            api_source: Arc::from(api_source),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn log(&self, data: EventData) {
        let event = LoggedEvent::new(
            self.request_id.as_ref(),
            self.api_source.as_ref(),
            Utc::now(),
            data,
        );
        self.events.lock().push(event);
    }

    /// Log a batch under one timestamp
    pub fn log_all<I>(&self, data: I)
    where
        I: IntoIterator<Item = EventData>,
    {
        let timestamp = Utc::now();
        let batch: Vec<LoggedEvent> = data
            .into_iter()
            .map(|data| {
                LoggedEvent::new(
                    self.request_id.as_ref(),
                    self.api_source.as_ref(),
                    timestamp,
                    data,
                )
            })
            .collect();

        if batch.is_empty() {
            return;
        }
        self.events.lock().extend(batch);
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of everything logged so far
    pub fn snapshot(&self) -> Vec<LoggedEvent> {
        self.events.lock().clone()
    }
}

/// Candidates as they entered the pipeline
pub fn candidate_events(candidates: &[ScoredCandidate]) -> Vec<EventData> {
    candidates
        .iter()
        .enumerate()
        .map(|(order, candidate)| {
            EventData::Candidate(CandidateEventData {
                entity_identifier: candidate.identifier().value().to_string(),
                entity_identifier_type: candidate.identifier().identifier_type().to_string(),
                candidate_score: candidate.score,
                candidate_order: order,
            })
        })
        .collect()
}

/// Candidates as they are returned to the caller
pub fn impression_events(candidates: &[ScoredCandidate]) -> Vec<EventData> {
    candidates
        .iter()
        .enumerate()
        .map(|(order, candidate)| {
            EventData::Impression(ImpressionEventData {
                entity_identifier: candidate.identifier().value().to_string(),
                entity_identifier_type: candidate.identifier().identifier_type().to_string(),
                impression_score: candidate.score,
                impression_order: order,
            })
        })
        .collect()
}

/// Receives the finished event list of a request. Delivery is
/// fire-and-forget from the pipeline's point of view.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, events: Vec<LoggedEvent>);
}

/// Writes events to the log
#[derive(Debug, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn publish(&self, events: Vec<LoggedEvent>) {
        info!(count = events.len(), "publishing logged events");
        for event in &events {
            match serde_json::to_string(event) {
                Ok(line) => debug!(event_type = %event.event_type, event = %line, "logged event"),
                Err(e) => debug!(error = %e, "failed to serialize logged event"),
            }
        }
    }
}

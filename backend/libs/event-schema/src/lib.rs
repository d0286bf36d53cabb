use chrono::{DateTime, Utc};
/// Audit-trail records emitted by the ranking pipeline
///
/// Every stage of a ranking request appends `LoggedEvent`s to a per-request
/// accumulator. Events are immutable once built and are handed to an event
/// sink in one batch when the request finishes.
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Current schema version for all logged events
pub const SCHEMA_VERSION: u32 = 1;

/// Kind of a logged event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    BusinessLogic,
    Candidate,
    Feature,
    Model,
    Impression,
    Custom,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            EventType::BusinessLogic => "BUSINESS_LOGIC",
            EventType::Candidate => "CANDIDATE",
            EventType::Feature => "FEATURE",
            EventType::Model => "MODEL",
            EventType::Impression => "IMPRESSION",
            EventType::Custom => "CUSTOM",
        };
        f.write_str(tag)
    }
}

/// Envelope shared by every event kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggedEvent {
    /// Unique event ID for idempotent delivery
    pub event_id: Uuid,
    pub request_id: String,
    /// Service (or API) that served the request
    pub api_source: String,
    pub event_timestamp: DateTime<Utc>,
    pub schema_version: u32,
    pub event_type: EventType,
    pub event_data: EventData,
}

impl LoggedEvent {
    /// Builds an event whose type tag is derived from its payload
    pub fn new(
        request_id: impl Into<String>,
        api_source: impl Into<String>,
        event_timestamp: DateTime<Utc>,
        event_data: EventData,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            request_id: request_id.into(),
            api_source: api_source.into(),
            event_timestamp,
            schema_version: SCHEMA_VERSION,
            event_type: event_data.event_type(),
            event_data,
        }
    }
}

/// Event payloads. The `event_type` on the envelope carries the tag, so the
/// payload itself serializes without one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventData {
    BusinessLogic(BusinessLogicEventData),
    Candidate(CandidateEventData),
    Feature(FeatureEventData),
    Model(ModelEventData),
    Impression(ImpressionEventData),
    Custom(serde_json::Value),
}

impl EventData {
    pub fn event_type(&self) -> EventType {
        match self {
            EventData::BusinessLogic(_) => EventType::BusinessLogic,
            EventData::Candidate(_) => EventType::Candidate,
            EventData::Feature(_) => EventType::Feature,
            EventData::Model(_) => EventType::Model,
            EventData::Impression(_) => EventType::Impression,
            EventData::Custom(_) => EventType::Custom,
        }
    }
}

// ============================================================================
// PIPELINE EVENTS
// ============================================================================

/// Score change produced by one business-logic stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessLogicEventData {
    pub business_logic_pipeline_order: usize,
    pub business_logic_name: String,
    pub old_score: f64,
    pub new_score: f64,
    pub entity_identifier: String,
    pub entity_identifier_type: String,
}

/// Candidate as it entered the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEventData {
    pub entity_identifier: String,
    pub entity_identifier_type: String,
    pub candidate_score: f64,
    pub candidate_order: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureEventData {
    pub feature_identifier: String,
    pub feature_identifier_type: String,
    pub feature_name: String,
    pub feature_value: serde_json::Value,
}

/// One model output for one entity. Entity fields are empty for
/// request-level models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEventData {
    pub model_name: String,
    pub model_output: String,
    pub entity_identifier: Option<String>,
    pub entity_identifier_type: Option<String>,
}

/// Candidate as it was returned to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpressionEventData {
    pub entity_identifier: String,
    pub entity_identifier_type: String,
    pub impression_score: f64,
    pub impression_order: usize,
}

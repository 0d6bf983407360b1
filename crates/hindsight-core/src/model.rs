//! Core data model (`spec.md` §3).
//!
//! Every entity is bank-scoped except `Bank` itself; there are no
//! cross-bank queries anywhere in the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// BANK
// ============================================================================

/// A tenant/profile scope. All other entities live inside exactly one bank.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bank {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub config: BankConfig,
    /// Three integer disposition traits, 1-5 each (e.g. formality, proactivity, verbosity).
    pub disposition: [u8; 3],
    pub mission: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-bank tunables referenced throughout the write/read/consolidation paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankConfig {
    pub extraction_mode: ExtractionMode,
    pub enable_consolidation: bool,
    pub reflect_budget: ReflectBudget,
    pub dedup_threshold: f32,
    /// Router thresholds, overriding the engine defaults for this bank.
    pub reinforce_threshold: f32,
    pub reconsolidate_threshold: f32,
    pub temporal_window_ms: i64,
    /// Phrase boundaries that force a new episode (`spec.md` §9 OQ3: configurable per bank).
    pub episode_boundary_phrases: Vec<String>,
}

impl Default for BankConfig {
    fn default() -> Self {
        Self {
            extraction_mode: ExtractionMode::Concise,
            enable_consolidation: true,
            reflect_budget: ReflectBudget::Mid,
            dedup_threshold: 0.92,
            reinforce_threshold: 0.92,
            reconsolidate_threshold: 0.75,
            temporal_window_ms: 24 * 60 * 60 * 1000,
            episode_boundary_phrases: vec![
                "new task".to_string(),
                "switching to".to_string(),
                "done with".to_string(),
                "moving on to".to_string(),
                "let's start".to_string(),
            ],
        }
    }
}

/// Extraction prompt selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    Concise,
    Verbose,
    Custom(String),
}

/// Reflect agent iteration budget (`spec.md` §4.10).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReflectBudget {
    Low,
    Mid,
    High,
}

impl ReflectBudget {
    pub fn max_iterations(self) -> u32 {
        match self {
            ReflectBudget::Low => 3,
            ReflectBudget::Mid => 5,
            ReflectBudget::High => 8,
        }
    }
}

// ============================================================================
// MEMORY UNIT
// ============================================================================

/// The atom of storage: a single fact, experience, opinion, or consolidated
/// observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUnit {
    /// Monotonic sortable id (ULID); sorts with creation order.
    pub id: String,
    pub bank_id: String,
    pub content: String,
    pub fact_type: FactType,
    pub confidence: f32,
    pub document_id: Option<String>,
    pub chunk_id: Option<String>,
    /// Temporal anchor in epoch milliseconds.
    pub event_date_ms: i64,
    /// True-event interval, when known.
    pub occurred_start_ms: Option<i64>,
    pub occurred_end_ms: Option<i64>,
    /// When this was referenced in the source text, if different from `event_date_ms`.
    pub mentioned_at_ms: Option<i64>,
    pub metadata: serde_json::Value,
    pub tags: Vec<String>,
    pub source_text: Option<String>,
    pub access_count: i64,
    pub last_accessed: DateTime<Utc>,
    pub encoding_strength: f32,
    pub gist: String,
    pub scope: Scope,
    pub consolidated_at: Option<DateTime<Utc>>,
    /// Populated only for `factType == Observation`.
    pub proof_count: Option<i64>,
    pub source_memory_ids: Vec<String>,
    pub history: Vec<MemoryRevision>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryUnit {
    /// A memory is an "observation" iff `factType == Observation` and it has
    /// at least one source memory (`spec.md` §3 invariant).
    pub fn is_observation(&self) -> bool {
        self.fact_type == FactType::Observation && !self.source_memory_ids.is_empty()
    }
}

/// A single prior revision of a memory's content, appended by reconsolidate
/// and by consolidation update/merge actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRevision {
    pub previous_text: String,
    pub reason: String,
    pub revised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FactType {
    World,
    Experience,
    Opinion,
    Observation,
}

impl FactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactType::World => "world",
            FactType::Experience => "experience",
            FactType::Opinion => "opinion",
            FactType::Observation => "observation",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "experience" => FactType::Experience,
            "opinion" => FactType::Opinion,
            "observation" => FactType::Observation,
            _ => FactType::World,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Profile,
    Project,
    Session,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Profile => "profile",
            Scope::Project => "project",
            Scope::Session => "session",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "project" => Scope::Project,
            "session" => Scope::Session,
            _ => Scope::Profile,
        }
    }
}

// ============================================================================
// ENTITY
// ============================================================================

/// A canonicalized named thing linked to memories.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    pub bank_id: String,
    pub name: String,
    pub entity_type: EntityType,
    pub mention_count: i64,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub description: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Organization,
    Place,
    Concept,
    Other,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "person",
            EntityType::Organization => "organization",
            EntityType::Place => "place",
            EntityType::Concept => "concept",
            EntityType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "person" => EntityType::Person,
            "organization" => EntityType::Organization,
            "place" => EntityType::Place,
            "concept" => EntityType::Concept,
            _ => EntityType::Other,
        }
    }
}

// ============================================================================
// LINKS
// ============================================================================

/// Typed directed edge between two memories.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryLink {
    pub id: String,
    pub bank_id: String,
    pub source_id: String,
    pub target_id: String,
    pub link_type: LinkType,
    pub weight: f32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Entity,
    Semantic,
    Temporal,
    CausedBy,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Entity => "entity",
            LinkType::Semantic => "semantic",
            LinkType::Temporal => "temporal",
            LinkType::CausedBy => "caused_by",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "semantic" => LinkType::Semantic,
            "temporal" => LinkType::Temporal,
            "caused_by" => LinkType::CausedBy,
            _ => LinkType::Entity,
        }
    }
}

/// Undirected entity co-occurrence count, canonicalized with `entity_a < entity_b`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityCooccurrence {
    pub bank_id: String,
    pub entity_a: String,
    pub entity_b: String,
    pub count: i64,
}

// ============================================================================
// EPISODES
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    pub id: String,
    pub bank_id: String,
    pub scope: Scope,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub last_event_at: DateTime<Utc>,
    pub event_count: i64,
    pub boundary_reason: BoundaryReason,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryReason {
    Initial,
    TimeGap,
    ScopeChange,
    PhraseBoundary,
}

impl BoundaryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BoundaryReason::Initial => "initial",
            BoundaryReason::TimeGap => "time_gap",
            BoundaryReason::ScopeChange => "scope_change",
            BoundaryReason::PhraseBoundary => "phrase_boundary",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeEvent {
    pub id: String,
    pub episode_id: String,
    pub memory_id: String,
    pub route: String,
    pub event_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeTemporalLink {
    pub id: String,
    pub bank_id: String,
    pub prior_episode_id: String,
    pub next_episode_id: String,
    pub gap_ms: i64,
}

// ============================================================================
// DOCUMENT / CHUNK
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub bank_id: String,
    pub content: String,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub bank_id: String,
    pub content: String,
    pub ordinal: i64,
}

// ============================================================================
// MENTAL MODEL / DIRECTIVE
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MentalModel {
    pub id: String,
    pub bank_id: String,
    pub name: String,
    pub source_query: String,
    pub content: Option<String>,
    pub source_memory_ids: Vec<String>,
    pub tags: Vec<String>,
    pub auto_refresh: bool,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directive {
    pub id: String,
    pub bank_id: String,
    pub name: String,
    pub content: String,
    pub priority: i32,
    pub is_active: bool,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// ASYNC OPERATIONS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncOperation {
    pub id: String,
    pub bank_id: String,
    pub task_type: TaskType,
    pub status: OpStatus,
    pub payload: serde_json::Value,
    pub items_count: i64,
    pub document_id: Option<String>,
    pub error_message: Option<String>,
    pub dedup_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Retain,
    Consolidation,
    RefreshMentalModel,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Retain => "retain",
            TaskType::Consolidation => "consolidation",
            TaskType::RefreshMentalModel => "refresh_mental_model",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpStatus::Pending => "pending",
            OpStatus::Processing => "processing",
            OpStatus::Completed => "completed",
            OpStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => OpStatus::Processing,
            "completed" => OpStatus::Completed,
            "failed" => OpStatus::Failed,
            _ => OpStatus::Pending,
        }
    }
}

// ============================================================================
// ROUTING DECISIONS
// ============================================================================

/// A logged routing decision, kept for replay/debug (`spec.md` §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDecisionRecord {
    pub id: String,
    pub bank_id: String,
    pub route: String,
    pub candidate_memory_id: Option<String>,
    pub candidate_score: Option<f32>,
    pub conflict_detected: bool,
    pub conflict_keys: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fact_type_roundtrips() {
        for ft in [
            FactType::World,
            FactType::Experience,
            FactType::Opinion,
            FactType::Observation,
        ] {
            assert_eq!(FactType::parse(ft.as_str()), ft);
        }
    }

    #[test]
    fn observation_requires_source_memories() {
        let mut m = sample_memory();
        m.fact_type = FactType::Observation;
        assert!(!m.is_observation());
        m.source_memory_ids.push("abc".to_string());
        assert!(m.is_observation());
    }

    fn sample_memory() -> MemoryUnit {
        let now = Utc::now();
        MemoryUnit {
            id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string(),
            bank_id: "bank-1".to_string(),
            content: "test".to_string(),
            fact_type: FactType::World,
            confidence: 1.0,
            document_id: None,
            chunk_id: None,
            event_date_ms: now.timestamp_millis(),
            occurred_start_ms: None,
            occurred_end_ms: None,
            mentioned_at_ms: None,
            metadata: serde_json::json!({}),
            tags: vec![],
            source_text: None,
            access_count: 0,
            last_accessed: now,
            encoding_strength: 1.0,
            gist: "test".to_string(),
            scope: Scope::Profile,
            consolidated_at: None,
            proof_count: None,
            source_memory_ids: vec![],
            history: vec![],
            created_at: now,
            updated_at: now,
        }
    }
}

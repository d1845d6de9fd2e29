//! Session subgraph surface
//!
//! The session store persists `Session → ActiveProject → TagUnit /
//! ConversationTurn` under the same graph as the knowledge layers. All writes
//! are idempotent merges; a property set to `None` never unsets an existing
//! value unless the method is explicitly a clearer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use cpq_core::TagPatch;

use crate::error::GraphResult;

/// A persisted tag unit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagRow {
    pub tag_id: String,
    pub filter_width: Option<i64>,
    pub filter_height: Option<i64>,
    pub filter_depth: Option<i64>,
    pub housing_width: Option<i64>,
    pub housing_height: Option<i64>,
    pub housing_length: Option<i64>,
    pub airflow_m3h: Option<i64>,
    pub product_family: Option<String>,
    pub product_code: Option<String>,
    pub weight_kg: Option<f64>,
    pub quantity: Option<i64>,
    pub modules_needed: Option<i64>,
    pub material_override: Option<String>,
    pub assembly_role: Option<String>,
    pub assembly_group_id: Option<String>,
    #[serde(default)]
    pub is_complete: bool,
}

/// The persisted project header
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectRow {
    pub name: Option<String>,
    pub customer: Option<String>,
    pub locked_material: Option<String>,
    pub detected_family: Option<String>,
    pub pending_clarification: Option<String>,
    #[serde(default)]
    pub accessories: Vec<String>,
    /// JSON-encoded map of resolved parameters
    pub resolved_params: Option<String>,
    /// JSON-encoded assembly group metadata
    pub assembly_group: Option<String>,
    /// JSON-encoded list of vetoed family ids
    pub vetoed_families: Option<String>,
}

/// Complete session state snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectState {
    pub session_id: String,
    pub project: Option<ProjectRow>,
    #[serde(default)]
    pub tags: Vec<TagRow>,
    #[serde(default)]
    pub tag_count: usize,
}

/// A stored conversation turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRow {
    pub role: String,
    pub message: String,
    pub turn_number: i64,
    pub created_at: i64,
    pub judge_results: Option<String>,
}

/// Session subgraph as nodes + relationships for visualization
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionGraphData {
    pub nodes: Vec<GraphNode>,
    pub relationships: Vec<GraphRel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub labels: Vec<String>,
    pub name: String,
    pub properties: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphRel {
    pub id: String,
    pub rel_type: String,
    pub source: String,
    pub target: String,
}

/// Write/read surface for the session subgraph
#[async_trait]
pub trait SessionGraph: Send + Sync {
    /// Create the session if absent; always refreshes `last_active`
    async fn ensure_session(&self, session_id: &str, user_id: &str) -> GraphResult<()>;

    async fn set_project(
        &self,
        session_id: &str,
        project_name: &str,
        customer: Option<&str>,
    ) -> GraphResult<()>;

    async fn lock_material(&self, session_id: &str, material_code: &str) -> GraphResult<()>;

    async fn set_detected_family(&self, session_id: &str, family: &str) -> GraphResult<()>;

    /// `None` clears the pending clarification (explicit clearer)
    async fn set_pending_clarification(
        &self,
        session_id: &str,
        param_name: Option<&str>,
    ) -> GraphResult<()>;

    async fn set_accessories(&self, session_id: &str, accessories: &[String]) -> GraphResult<()>;

    async fn set_assembly_group(&self, session_id: &str, assembly_json: &str) -> GraphResult<()>;

    async fn set_resolved_params(&self, session_id: &str, params_json: &str) -> GraphResult<()>;

    async fn set_vetoed_families(&self, session_id: &str, vetoed_json: &str) -> GraphResult<()>;

    /// Merge non-null patch fields into the tag; synchronize `sync_properties`
    /// across assembly siblings in the same write; recompute `is_complete`.
    /// Returns the tag's state after the write.
    async fn upsert_tag(
        &self,
        session_id: &str,
        tag_id: &str,
        patch: &TagPatch,
        sync_properties: &[String],
    ) -> GraphResult<TagRow>;

    async fn get_project_state(&self, session_id: &str) -> GraphResult<ProjectState>;

    /// Idempotent by `TURN_{session}_{turn}_{role}`; rejects a rewrite whose
    /// `at_ms` is older than the stored turn's `created_at`
    async fn store_turn(
        &self,
        session_id: &str,
        role: &str,
        message: &str,
        turn_number: i64,
        at_ms: i64,
    ) -> GraphResult<()>;

    /// Last `n` turns in chronological order (oldest first)
    async fn get_recent_turns(&self, session_id: &str, n: usize) -> GraphResult<Vec<TurnRow>>;

    /// Detach-delete the entire session subgraph
    async fn clear_session(&self, session_id: &str) -> GraphResult<()>;

    /// Remove sessions idle longer than `max_age_ms`; returns removed count
    async fn cleanup_stale_sessions(&self, max_age_ms: i64) -> GraphResult<u64>;

    async fn get_session_graph_data(&self, session_id: &str) -> GraphResult<SessionGraphData>;
}

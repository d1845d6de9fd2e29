//! Typed session store

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use cpq_config::TenantConfig;
use cpq_core::TagPatch;
use cpq_graph::{ProjectState, SessionGraph, SessionGraphData, TagRow, TurnRow};

use crate::SessionError;

/// Guard serializing turns on one session
pub struct SessionLockGuard {
    _guard: OwnedMutexGuard<()>,
}

/// Session store over a graph backend
pub struct SessionStore {
    backend: Arc<dyn SessionGraph>,
    tenant: Arc<TenantConfig>,
    /// Per-session turn serialization; never a global lock
    locks: DashMap<String, Arc<Mutex<()>>>,
    lock_wait: Duration,
    ttl_ms: i64,
}

impl SessionStore {
    pub fn new(
        backend: Arc<dyn SessionGraph>,
        tenant: Arc<TenantConfig>,
        lock_wait: Duration,
        ttl_ms: i64,
    ) -> Self {
        Self {
            backend,
            tenant,
            locks: DashMap::new(),
            lock_wait,
            ttl_ms,
        }
    }

    pub fn tenant(&self) -> &TenantConfig {
        &self.tenant
    }

    /// Acquire the per-session lock, waiting up to the configured threshold.
    /// The lifecycle `user turn → engine → persist → assistant turn` runs
    /// entirely under this guard.
    pub async fn lock_session(&self, session_id: &str) -> Result<SessionLockGuard, SessionError> {
        let mutex = self
            .locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        match tokio::time::timeout(self.lock_wait, mutex.lock_owned()).await {
            Ok(guard) => Ok(SessionLockGuard { _guard: guard }),
            Err(_) => Err(SessionError::LockConflict {
                session_id: session_id.to_string(),
            }),
        }
    }

    pub async fn ensure_session(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<(), SessionError> {
        Ok(self.backend.ensure_session(session_id, user_id).await?)
    }

    pub async fn set_project(
        &self,
        session_id: &str,
        project_name: &str,
        customer: Option<&str>,
    ) -> Result<(), SessionError> {
        Ok(self
            .backend
            .set_project(session_id, project_name, customer)
            .await?)
    }

    pub async fn lock_material(
        &self,
        session_id: &str,
        material_code: &str,
    ) -> Result<(), SessionError> {
        Ok(self.backend.lock_material(session_id, material_code).await?)
    }

    pub async fn set_detected_family(
        &self,
        session_id: &str,
        family: &str,
    ) -> Result<(), SessionError> {
        Ok(self.backend.set_detected_family(session_id, family).await?)
    }

    pub async fn set_pending_clarification(
        &self,
        session_id: &str,
        param_name: Option<&str>,
    ) -> Result<(), SessionError> {
        Ok(self
            .backend
            .set_pending_clarification(session_id, param_name)
            .await?)
    }

    pub async fn set_accessories(
        &self,
        session_id: &str,
        accessories: &[String],
    ) -> Result<(), SessionError> {
        Ok(self.backend.set_accessories(session_id, accessories).await?)
    }

    pub async fn set_assembly_group(
        &self,
        session_id: &str,
        assembly_json: &str,
    ) -> Result<(), SessionError> {
        Ok(self
            .backend
            .set_assembly_group(session_id, assembly_json)
            .await?)
    }

    pub async fn set_resolved_params(
        &self,
        session_id: &str,
        params_json: &str,
    ) -> Result<(), SessionError> {
        Ok(self
            .backend
            .set_resolved_params(session_id, params_json)
            .await?)
    }

    pub async fn set_vetoed_families(
        &self,
        session_id: &str,
        vetoed_json: &str,
    ) -> Result<(), SessionError> {
        Ok(self
            .backend
            .set_vetoed_families(session_id, vetoed_json)
            .await?)
    }

    /// Merge fields into a tag, deriving housing dimensions and length from
    /// the tenant tables first so the graph holds the derived values
    pub async fn upsert_tag(
        &self,
        session_id: &str,
        tag_id: &str,
        patch: &TagPatch,
    ) -> Result<TagRow, SessionError> {
        let derived = self.derive_patch(patch);
        let tag = self
            .backend
            .upsert_tag(
                session_id,
                tag_id,
                &derived,
                &self.tenant.assembly_shared_properties,
            )
            .await?;
        tracing::debug!(
            session_id = %session_id,
            tag_id = %tag_id,
            is_complete = tag.is_complete,
            "tag upserted"
        );
        Ok(tag)
    }

    /// Apply dimension mapping and depth→length derivation to a patch
    fn derive_patch(&self, patch: &TagPatch) -> TagPatch {
        let mut out = patch.clone();
        if out.housing_width.is_none() {
            out.housing_width = patch.filter_width.map(|d| self.tenant.map_dimension(d));
        }
        if out.housing_height.is_none() {
            out.housing_height = patch.filter_height.map(|d| self.tenant.map_dimension(d));
        }
        if out.housing_length.is_none() {
            if let Some(depth) = patch.filter_depth {
                out.housing_length = Some(
                    self.tenant
                        .derive_housing_length(depth, patch.product_family.as_deref()),
                );
            }
        }
        out
    }

    pub async fn get_project_state(
        &self,
        session_id: &str,
    ) -> Result<ProjectState, SessionError> {
        Ok(self.backend.get_project_state(session_id).await?)
    }

    /// Store one turn; idempotent per `(session, turn_number, role)` and
    /// truncated to the backend message limit
    pub async fn store_turn(
        &self,
        session_id: &str,
        role: &str,
        message: &str,
        turn_number: i64,
    ) -> Result<(), SessionError> {
        let now = chrono::Utc::now().timestamp_millis();
        Ok(self
            .backend
            .store_turn(session_id, role, message, turn_number, now)
            .await?)
    }

    pub async fn get_recent_turns(
        &self,
        session_id: &str,
        n: usize,
    ) -> Result<Vec<TurnRow>, SessionError> {
        Ok(self.backend.get_recent_turns(session_id, n).await?)
    }

    /// Per-tag audit trail, e.g.
    /// `Material locked to RF -> Filter 600x600mm -> Sized to 600x600 -> Length 550mm`
    pub async fn get_reasoning_path(
        &self,
        session_id: &str,
    ) -> Result<Vec<(String, String)>, SessionError> {
        let state = self.get_project_state(session_id).await?;
        let material = state
            .project
            .as_ref()
            .and_then(|p| p.locked_material.clone());
        let mut paths = Vec::new();
        for tag in &state.tags {
            let mut steps = Vec::new();
            if let Some(m) = &material {
                steps.push(format!("Material locked to {m}"));
            }
            if let (Some(w), Some(h)) = (tag.filter_width, tag.filter_height) {
                steps.push(format!("Filter {w}x{h}mm"));
            }
            if let (Some(w), Some(h)) = (tag.housing_width, tag.housing_height) {
                steps.push(format!("Sized to {w}x{h}"));
            }
            if let Some(l) = tag.housing_length {
                steps.push(format!("Length {l}mm"));
            }
            if let Some(w) = tag.weight_kg {
                steps.push(format!("Weight {w}kg"));
            }
            if let Some(code) = &tag.product_code {
                steps.push(format!("Code: {code}"));
            }
            let path = if steps.is_empty() {
                "No data yet".to_string()
            } else {
                steps.join(" -> ")
            };
            paths.push((tag.tag_id.clone(), path));
        }
        Ok(paths)
    }

    pub async fn clear_session(&self, session_id: &str) -> Result<(), SessionError> {
        self.locks.remove(session_id);
        Ok(self.backend.clear_session(session_id).await?)
    }

    pub async fn cleanup_stale_sessions(&self) -> Result<u64, SessionError> {
        Ok(self.backend.cleanup_stale_sessions(self.ttl_ms).await?)
    }

    pub async fn get_session_graph_data(
        &self,
        session_id: &str,
    ) -> Result<SessionGraphData, SessionError> {
        Ok(self.backend.get_session_graph_data(session_id).await?)
    }

    /// Spawn the periodic stale-session sweeper
    pub fn spawn_cleanup_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match store.cleanup_stale_sessions().await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(count = n, "session sweep removed stale sessions"),
                    Err(e) => tracing::warn!(error = %e, "session sweep failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpq_graph::MemoryGraph;

    fn tenant() -> Arc<TenantConfig> {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../config/tenants/hvac_filtration/config.yaml");
        Arc::new(TenantConfig::load(&path).unwrap())
    }

    fn store() -> Arc<SessionStore> {
        Arc::new(SessionStore::new(
            Arc::new(MemoryGraph::new()),
            tenant(),
            Duration::from_millis(200),
            7_200_000,
        ))
    }

    #[tokio::test]
    async fn test_ensure_session_idempotent() {
        let store = store();
        store.ensure_session("s1", "user").await.unwrap();
        store.ensure_session("s1", "user").await.unwrap();
        let state = store.get_project_state("s1").await.unwrap();
        assert_eq!(state.session_id, "s1");
        assert_eq!(state.tag_count, 0);
    }

    #[tokio::test]
    async fn test_upsert_tag_derives_housing_dims_and_length() {
        let store = store();
        store.ensure_session("s1", "user").await.unwrap();
        let patch = TagPatch {
            filter_width: Some(592),
            filter_height: Some(610),
            filter_depth: Some(292),
            airflow_m3h: Some(3000),
            ..Default::default()
        };
        let tag = store.upsert_tag("s1", "item_1", &patch).await.unwrap();
        assert_eq!(tag.housing_width, Some(600));
        assert_eq!(tag.housing_height, Some(600));
        assert_eq!(tag.housing_length, Some(550));
        assert!(tag.is_complete);
    }

    #[tokio::test]
    async fn test_upsert_uses_family_specific_length_table() {
        let store = store();
        store.ensure_session("s1", "user").await.unwrap();
        let patch = TagPatch {
            filter_depth: Some(300),
            product_family: Some("GDC".into()),
            ..Default::default()
        };
        let tag = store.upsert_tag("s1", "carbon", &patch).await.unwrap();
        assert_eq!(tag.housing_length, Some(750));
    }

    #[tokio::test]
    async fn test_explicit_length_not_overridden() {
        let store = store();
        store.ensure_session("s1", "user").await.unwrap();
        let patch = TagPatch {
            filter_depth: Some(292),
            housing_length: Some(900),
            ..Default::default()
        };
        let tag = store.upsert_tag("s1", "item_1", &patch).await.unwrap();
        assert_eq!(tag.housing_length, Some(900));
    }

    #[tokio::test]
    async fn test_empty_patch_preserves_fields() {
        let store = store();
        store.ensure_session("s1", "user").await.unwrap();
        let patch = TagPatch {
            filter_width: Some(600),
            filter_height: Some(600),
            filter_depth: Some(292),
            ..Default::default()
        };
        store.upsert_tag("s1", "item_1", &patch).await.unwrap();
        let tag = store
            .upsert_tag("s1", "item_1", &TagPatch::default())
            .await
            .unwrap();
        assert_eq!(tag.housing_width, Some(600));
        assert_eq!(tag.housing_length, Some(550));
    }

    #[tokio::test]
    async fn test_session_lock_conflict() {
        let store = store();
        let guard = store.lock_session("s1").await.unwrap();
        let err = store.lock_session("s1").await;
        assert!(matches!(err, Err(SessionError::LockConflict { .. })));
        drop(guard);
        assert!(store.lock_session("s1").await.is_ok());
    }

    #[tokio::test]
    async fn test_locks_are_per_session_not_global() {
        let store = store();
        let _g1 = store.lock_session("s1").await.unwrap();
        // A different session is not blocked
        assert!(store.lock_session("s2").await.is_ok());
    }

    #[tokio::test]
    async fn test_turn_roundtrip_and_idempotency() {
        let store = store();
        store.ensure_session("s1", "user").await.unwrap();
        store.store_turn("s1", "user", "hello", 1).await.unwrap();
        store.store_turn("s1", "user", "hello", 1).await.unwrap();
        store.store_turn("s1", "assistant", "hi there", 2).await.unwrap();
        let turns = store.get_recent_turns("s1", 10).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, "user");
        assert_eq!(turns[1].role, "assistant");
    }

    #[tokio::test]
    async fn test_reasoning_path_format() {
        let store = store();
        store.ensure_session("s1", "user").await.unwrap();
        store.lock_material("s1", "rf").await.unwrap();
        let patch = TagPatch {
            filter_width: Some(305),
            filter_height: Some(610),
            filter_depth: Some(292),
            ..Default::default()
        };
        store.upsert_tag("s1", "5684", &patch).await.unwrap();
        let paths = store.get_reasoning_path("s1").await.unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].0, "5684");
        assert!(paths[0].1.starts_with("Material locked to RF"));
        assert!(paths[0].1.contains("Length 550mm"));
    }
}

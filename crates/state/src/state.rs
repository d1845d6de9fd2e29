//! Session-scoped cumulative state

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use cpq_config::TenantConfig;
use cpq_core::{AssemblyStage, StageRole, TagPatch};
use cpq_graph::{CodeFormatRow, GraphReader};
use cpq_session::{SessionError, SessionStore};

use crate::tag::TagSpecification;

/// Stage metadata persisted with the assembly group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyStageMeta {
    pub role: String,
    pub product_family: String,
    pub tag_id: String,
    #[serde(default)]
    pub provides_trait: String,
    #[serde(default)]
    pub reason: String,
}

/// Multi-stage assembly tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyGroup {
    pub group_id: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub stages: Vec<AssemblyStageMeta>,
}

/// Cumulative technical state for an engineering session
///
/// New information is merged, never replaced. Project name and material are
/// locked on first set.
#[derive(Debug, Clone)]
pub struct TechnicalState {
    pub project_name: Option<String>,
    pub locked_material: Option<String>,
    pub detected_family: Option<String>,
    pub tags: BTreeMap<String, TagSpecification>,
    pub turn_count: i64,
    pub accessories: Vec<String>,
    pub pending_clarification: Option<String>,
    /// Graph-driven resolved parameters keyed by property_key
    pub resolved_params: BTreeMap<String, String>,
    pub assembly_group: Option<AssemblyGroup>,
    /// Families vetoed by the engine, remembered across turns
    pub vetoed_families: Vec<String>,

    config: Arc<TenantConfig>,
}

/// Serializable snapshot of the state (API payloads, debugging)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub project_name: Option<String>,
    pub locked_material: Option<String>,
    pub detected_family: Option<String>,
    #[serde(default)]
    pub accessories: Vec<String>,
    pub pending_clarification: Option<String>,
    #[serde(default)]
    pub resolved_params: BTreeMap<String, String>,
    pub assembly_group: Option<AssemblyGroup>,
    #[serde(default)]
    pub vetoed_families: Vec<String>,
    #[serde(default)]
    pub turn_count: i64,
    #[serde(default)]
    pub tags: BTreeMap<String, TagSpecification>,
}

impl TechnicalState {
    pub fn new(config: Arc<TenantConfig>) -> Self {
        Self {
            project_name: None,
            locked_material: None,
            detected_family: None,
            tags: BTreeMap::new(),
            turn_count: 0,
            accessories: Vec::new(),
            pending_clarification: None,
            resolved_params: BTreeMap::new(),
            assembly_group: None,
            vetoed_families: Vec::new(),
            config,
        }
    }

    pub fn config(&self) -> &TenantConfig {
        &self.config
    }

    /// Merge new data into a tag. Only non-null fields update; derived values
    /// are recomputed after every merge; assembly siblings are synced.
    pub fn merge_tag(&mut self, tag_id: &str, patch: TagPatch) -> &TagSpecification {
        let tag = self
            .tags
            .entry(tag_id.to_string())
            .or_insert_with(|| TagSpecification::new(tag_id));
        tag.apply_patch(&patch);
        tag.compute_housing_from_filter(&self.config);
        tag.compute_housing_length_from_depth(&self.config);
        tag.check_completeness();

        let in_assembly = tag.assembly_group_id.is_some();
        if in_assembly && self.assembly_group.is_some() {
            self.sync_assembly_params();
        }
        &self.tags[tag_id]
    }

    /// Copy shared properties across assembly siblings: first non-null wins,
    /// existing values are never replaced. `housing_length` stays per-stage.
    fn sync_assembly_params(&mut self) {
        let Some(group) = &self.assembly_group else {
            return;
        };
        let stage_ids: Vec<String> = group.stages.iter().map(|s| s.tag_id.clone()).collect();
        let shared = self.config.assembly_shared_properties.clone();
        if shared.is_empty() {
            return;
        }

        for prop in &shared {
            let best = stage_ids
                .iter()
                .filter_map(|id| self.tags.get(id))
                .find_map(|t| tag_prop(t, prop));
            let Some(best) = best else { continue };
            for id in &stage_ids {
                if let Some(tag) = self.tags.get_mut(id) {
                    if tag_prop(tag, prop).is_none() {
                        set_tag_prop(tag, prop, best);
                    }
                }
            }
        }
        for id in &stage_ids {
            if let Some(tag) = self.tags.get_mut(id) {
                tag.compute_housing_from_filter(&self.config);
                tag.compute_housing_length_from_depth(&self.config);
                tag.check_completeness();
            }
        }
    }

    /// Expand an engine assembly verdict into per-stage tags named
    /// `{base}_stage_{n}`. Stages share dimensions and airflow from the base
    /// tag; each derives its own housing length. The base tag is removed.
    pub fn create_assembly_tags(&mut self, stages: &[AssemblyStage], base_tag_id: &str) {
        let group_id = format!("assembly_{base_tag_id}");
        let base = self.tags.get(base_tag_id).cloned();

        let mut stage_meta = Vec::new();
        for (i, stage) in stages.iter().enumerate() {
            let tag_id = format!("{base_tag_id}_stage_{}", i + 1);
            let family = short_family_name(&stage.product_family_name, &stage.product_family_id);
            let mut patch = TagPatch {
                product_family: Some(family.clone()),
                assembly_role: Some(stage.role),
                assembly_group_id: Some(group_id.clone()),
                ..Default::default()
            };
            if let Some(base) = &base {
                patch.filter_width = base.filter_width;
                patch.filter_height = base.filter_height;
                patch.filter_depth = base.filter_depth;
                patch.airflow_m3h = base.airflow_m3h;
            }
            self.merge_tag(&tag_id, patch);
            stage_meta.push(AssemblyStageMeta {
                role: stage.role.to_string(),
                product_family: family,
                tag_id,
                provides_trait: stage.provides_trait_name.clone(),
                reason: stage.reason.clone(),
            });
        }

        self.tags.remove(base_tag_id);
        self.assembly_group = Some(AssemblyGroup {
            group_id,
            rationale: String::new(),
            stages: stage_meta,
        });
        self.sync_assembly_params();
    }

    /// Lock the material. No-op once set. Accepts codes and tenant aliases.
    pub fn lock_material(&mut self, material: &str) {
        if self.locked_material.is_some() {
            return;
        }
        self.locked_material = self.config.normalize_material(material);
    }

    /// Set the project name. No-op once set.
    pub fn set_project(&mut self, project_name: &str) {
        if self.project_name.is_none() {
            self.project_name = Some(project_name.to_string());
        }
    }

    pub fn all_tags_complete(&self) -> bool {
        !self.tags.is_empty() && self.tags.values().all(|t| t.is_complete)
    }

    pub fn missing_params_by_tag(&self) -> BTreeMap<String, Vec<String>> {
        self.tags
            .iter()
            .filter(|(_, t)| !t.missing_params.is_empty())
            .map(|(id, t)| (id.clone(), t.missing_params.clone()))
            .collect()
    }

    // -----------------------------------------------------------------
    // Product codes
    // -----------------------------------------------------------------

    /// Build a product code from the graph-supplied template
    ///
    /// Placeholders: `{family} {width} {height} {length} {frame_depth}
    /// {material} {connection} {side}`. Consecutive hyphens from absent
    /// placeholders collapse. Falls back to `{family}-{W}x{H}[-{length}]`.
    pub fn build_product_code(
        &self,
        tag: &TagSpecification,
        code_format: Option<&CodeFormatRow>,
    ) -> String {
        let family = tag
            .product_family
            .clone()
            .or_else(|| self.detected_family.clone())
            .unwrap_or_default()
            .replace('_', "-");
        let material = tag
            .material_override
            .clone()
            .or_else(|| self.locked_material.clone())
            .unwrap_or_else(|| self.config.default_material.clone());
        let connection = self
            .resolved_params
            .get("connection_type")
            .cloned()
            .unwrap_or_else(|| "PG".to_string());
        let side = self
            .resolved_params
            .get("side")
            .cloned()
            .unwrap_or_else(|| "R".to_string());

        let length_offset: i64 = self
            .resolved_params
            .get("connection_length_offset")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let length = tag.housing_length.unwrap_or(0);
        let effective_length = if length > 0 { length + length_offset } else { 0 };

        let frame_depth = self
            .resolved_params
            .get("frame_depth")
            .and_then(|v| v.parse::<i64>().ok())
            .or_else(|| code_format.and_then(|f| f.default_frame_depth));

        if let Some(fmt) = code_format.and_then(|f| f.fmt.clone()) {
            let mut code = fmt
                .replace("{family}", &family)
                .replace("{width}", &opt_num(tag.housing_width))
                .replace("{height}", &opt_num(tag.housing_height))
                .replace(
                    "{length}",
                    &if effective_length > 0 {
                        effective_length.to_string()
                    } else {
                        String::new()
                    },
                )
                .replace("{frame_depth}", &opt_num(frame_depth))
                .replace("{material}", &material)
                .replace("{connection}", &connection)
                .replace("{side}", &side);
            while code.contains("--") {
                code = code.replace("--", "-");
            }
            return code.trim_end_matches('-').to_string();
        }

        // Generic fallback
        let mut parts = vec![family];
        if let Some(size) = tag.housing_size_string() {
            parts.push(size);
        }
        if let Some(length) = tag.housing_length {
            parts.push(length.to_string());
        }
        parts.retain(|p| !p.is_empty());
        parts.join("-")
    }

    /// Audit every product code against the locked material. Mismatched
    /// suffixes are rewritten and reported.
    pub fn verify_material_codes(&mut self) -> Vec<String> {
        let Some(locked) = self.locked_material.clone() else {
            return Vec::new();
        };
        let suffix = format!("-{locked}");
        let mut warnings = Vec::new();
        for (tag_id, tag) in self.tags.iter_mut() {
            let Some(code) = tag.product_code.clone() else {
                continue;
            };
            if code.ends_with(&suffix) || tag.material_override.is_some() {
                continue;
            }
            warnings.push(format!(
                "Tag {tag_id}: Product code '{code}' does not end with locked material '{suffix}'"
            ));
            let rewritten = match code.rfind('-') {
                Some(idx) => format!("{}{suffix}", &code[..idx]),
                None => format!("{code}{suffix}"),
            };
            tracing::warn!(tag_id = %tag_id, from = %code, to = %rewritten, "material suffix corrected");
            tag.product_code = Some(rewritten);
        }
        warnings
    }

    // -----------------------------------------------------------------
    // Weight enrichment
    // -----------------------------------------------------------------

    /// Look up weights for complete tags: exact variant first, then the
    /// parametric dimension-module model. Aggregates totals for multi-module
    /// arrangements and rebuilds stale product codes containing `--`.
    pub async fn enrich_with_weights(&mut self, reader: &dyn GraphReader) {
        let tag_ids: Vec<String> = self.tags.keys().cloned().collect();
        for tag_id in tag_ids {
            let Some(tag) = self.tags.get(&tag_id).cloned() else {
                continue;
            };
            let mut tag = tag;

            if tag.is_complete && tag.product_code.is_none() {
                let family = tag
                    .product_family
                    .clone()
                    .or_else(|| self.detected_family.clone())
                    .unwrap_or_default();
                let fmt = if family.is_empty() {
                    None
                } else {
                    reader
                        .get_product_family_code_format(&family)
                        .await
                        .ok()
                        .flatten()
                };
                tag.product_code = Some(self.build_product_code(&tag, fmt.as_ref()));
            }

            if tag.is_complete && tag.weight_kg.is_none() {
                let family = tag
                    .product_family
                    .clone()
                    .or_else(|| self.detected_family.clone())
                    .unwrap_or_default();
                if let (Some(w), Some(h)) = (tag.housing_width, tag.housing_height) {
                    if !family.is_empty() {
                        if let Some(length) = tag.housing_length {
                            let key = format!("{family}-{w}x{h}-{length}");
                            if let Ok(Some(weight)) =
                                reader.get_variant_weight(&key, Some(length)).await
                            {
                                tag.weight_kg = Some(weight);
                            }
                        }
                        if tag.weight_kg.is_none() {
                            let key = format!("{family}-{w}x{h}");
                            if let Ok(Some(weight)) = reader.get_variant_weight(&key, None).await {
                                tag.weight_kg = Some(weight);
                            }
                        }
                    }
                    // Parametric fallback
                    if tag.weight_kg.is_none() {
                        if let Ok(Some(model)) = reader.get_dimension_module_weight(w, h).await {
                            let per_mm = model.weight_per_mm_length.unwrap_or(0.0);
                            let ref_len = model.reference_length_mm.unwrap_or(550);
                            let actual = tag.housing_length.unwrap_or(ref_len);
                            let weight =
                                model.unit_weight_kg + (actual - ref_len) as f64 * per_mm;
                            tag.weight_kg = Some((weight * 10.0).round() / 10.0);
                        }
                    }
                }
            }

            if tag.rated_airflow_m3h.is_none() {
                if let (Some(w), Some(h)) = (tag.housing_width, tag.housing_height) {
                    let family = tag
                        .product_family
                        .clone()
                        .or_else(|| self.detected_family.clone());
                    if let Ok(rated) = reader
                        .get_reference_airflow_for_dimensions(w, h, family.as_deref())
                        .await
                    {
                        tag.rated_airflow_m3h = rated;
                    }
                }
            }

            // Stale codes from earlier turns may carry collapsed placeholders
            if let Some(code) = &tag.product_code {
                if code.contains("--") && tag.housing_length.is_some() {
                    let family = tag
                        .product_family
                        .clone()
                        .or_else(|| self.detected_family.clone())
                        .unwrap_or_default();
                    let fmt = if family.is_empty() {
                        None
                    } else {
                        reader
                            .get_product_family_code_format(&family)
                            .await
                            .ok()
                            .flatten()
                    };
                    tag.product_code = Some(self.build_product_code(&tag, fmt.as_ref()));
                }
            }

            // Multi-module aggregation
            if tag.modules_needed > 1 {
                tag.total_weight_kg = tag
                    .weight_kg
                    .map(|w| ((w * tag.modules_needed as f64) * 10.0).round() / 10.0);
                tag.total_airflow_m3h = tag.airflow_m3h.map(|a| a * tag.modules_needed);
            } else {
                tag.total_weight_kg = tag.weight_kg;
                tag.total_airflow_m3h = tag.airflow_m3h;
            }

            self.tags.insert(tag_id, tag);
        }
    }

    // -----------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------

    /// Write the state to the session store (the graph is the source of truth)
    pub async fn persist_to_graph(
        &self,
        store: &SessionStore,
        session_id: &str,
    ) -> Result<(), SessionError> {
        store.ensure_session(session_id, "default").await?;

        if let Some(name) = &self.project_name {
            store.set_project(session_id, name, None).await?;
        }
        if let Some(material) = &self.locked_material {
            store.lock_material(session_id, material).await?;
        }
        if let Some(family) = &self.detected_family {
            store.set_detected_family(session_id, family).await?;
        }
        store
            .set_pending_clarification(session_id, self.pending_clarification.as_deref())
            .await?;
        if !self.accessories.is_empty() {
            store.set_accessories(session_id, &self.accessories).await?;
        }
        if !self.resolved_params.is_empty() {
            let json = serde_json::to_string(&self.resolved_params).unwrap_or_default();
            store.set_resolved_params(session_id, &json).await?;
        }
        if let Some(group) = &self.assembly_group {
            let json = serde_json::to_string(group).unwrap_or_default();
            store.set_assembly_group(session_id, &json).await?;
        }
        if !self.vetoed_families.is_empty() {
            let json = serde_json::to_string(&self.vetoed_families).unwrap_or_default();
            store.set_vetoed_families(session_id, &json).await?;
        }

        for (tag_id, tag) in &self.tags {
            let patch = TagPatch {
                filter_width: tag.filter_width,
                filter_height: tag.filter_height,
                filter_depth: tag.filter_depth,
                housing_width: tag.housing_width,
                housing_height: tag.housing_height,
                housing_length: tag.housing_length,
                airflow_m3h: tag.airflow_m3h,
                product_family: tag.product_family.clone(),
                product_code: tag.product_code.clone(),
                weight_kg: tag.weight_kg,
                quantity: Some(tag.quantity),
                modules_needed: Some(tag.modules_needed),
                material_override: tag.material_override.clone(),
                assembly_role: tag.assembly_role,
                assembly_group_id: tag.assembly_group_id.clone(),
                source_turn: Some(self.turn_count),
            };
            store.upsert_tag(session_id, tag_id, &patch).await?;
        }
        Ok(())
    }

    /// Reconstruct a working state from the session store. JSON-encoded
    /// fields are decoded; derivations and completeness are recomputed, not
    /// trusted from storage.
    pub async fn load_from_graph(
        store: &SessionStore,
        session_id: &str,
        config: Arc<TenantConfig>,
    ) -> Result<Self, SessionError> {
        let data = store.get_project_state(session_id).await?;
        let mut state = TechnicalState::new(config);

        if let Some(project) = &data.project {
            state.project_name = project.name.clone();
            if let Some(material) = &project.locked_material {
                state.lock_material(material);
            }
            state.detected_family = project.detected_family.clone();
            state.pending_clarification = project.pending_clarification.clone();
            state.accessories = project.accessories.clone();
            if let Some(raw) = &project.resolved_params {
                if let Ok(map) = serde_json::from_str(raw) {
                    state.resolved_params = map;
                }
            }
            if let Some(raw) = &project.assembly_group {
                if let Ok(group) = serde_json::from_str::<AssemblyGroup>(raw) {
                    state.assembly_group = Some(group);
                }
            }
            if let Some(raw) = &project.vetoed_families {
                if let Ok(vetoed) = serde_json::from_str(raw) {
                    state.vetoed_families = vetoed;
                }
            }
        }

        for row in &data.tags {
            let patch = TagPatch {
                filter_width: row.filter_width,
                filter_height: row.filter_height,
                filter_depth: row.filter_depth,
                housing_length: row.housing_length,
                airflow_m3h: row.airflow_m3h,
                product_family: row.product_family.clone(),
                product_code: row.product_code.clone(),
                weight_kg: row.weight_kg,
                quantity: row.quantity,
                modules_needed: row.modules_needed,
                material_override: row.material_override.clone(),
                ..Default::default()
            };
            state.merge_tag(&row.tag_id, patch);
        }

        // Restore assembly membership from the group metadata
        if let Some(group) = state.assembly_group.clone() {
            for stage in &group.stages {
                if let Some(tag) = state.tags.get_mut(&stage.tag_id) {
                    tag.assembly_role = StageRole::parse(&stage.role);
                    tag.assembly_group_id = Some(group.group_id.clone());
                }
            }
        }

        Ok(state)
    }

    // -----------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------

    pub fn to_snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            project_name: self.project_name.clone(),
            locked_material: self.locked_material.clone(),
            detected_family: self.detected_family.clone(),
            accessories: self.accessories.clone(),
            pending_clarification: self.pending_clarification.clone(),
            resolved_params: self.resolved_params.clone(),
            assembly_group: self.assembly_group.clone(),
            vetoed_families: self.vetoed_families.clone(),
            turn_count: self.turn_count,
            tags: self.tags.clone(),
        }
    }

    /// Rebuild from a snapshot; completeness and derivations are recomputed
    pub fn from_snapshot(snapshot: StateSnapshot, config: Arc<TenantConfig>) -> Self {
        let mut state = TechnicalState::new(config);
        state.project_name = snapshot.project_name;
        if let Some(material) = snapshot.locked_material {
            state.lock_material(&material);
        }
        state.detected_family = snapshot.detected_family;
        state.accessories = snapshot.accessories;
        state.pending_clarification = snapshot.pending_clarification;
        state.resolved_params = snapshot.resolved_params;
        state.assembly_group = snapshot.assembly_group;
        state.vetoed_families = snapshot.vetoed_families;
        state.turn_count = snapshot.turn_count;
        for (tag_id, mut tag) in snapshot.tags {
            if tag.housing_width.is_none() || tag.housing_height.is_none() {
                tag.compute_housing_from_filter(&state.config);
            }
            tag.compute_housing_length_from_depth(&state.config);
            tag.check_completeness();
            state.tags.insert(tag_id, tag);
        }
        state
    }
}

fn opt_num(v: Option<i64>) -> String {
    v.map(|n| n.to_string()).unwrap_or_default()
}

/// `"GDP Planfilter housing"` → `"GDP"`; falls back to the id without `FAM_`
fn short_family_name(name: &str, id: &str) -> String {
    let name = if name.is_empty() {
        id.trim_start_matches("FAM_")
    } else {
        name
    };
    name.split_whitespace().next().unwrap_or(name).to_string()
}

fn tag_prop(tag: &TagSpecification, prop: &str) -> Option<i64> {
    match prop {
        "filter_width" => tag.filter_width,
        "filter_height" => tag.filter_height,
        "filter_depth" => tag.filter_depth,
        "housing_width" => tag.housing_width,
        "housing_height" => tag.housing_height,
        "airflow_m3h" => tag.airflow_m3h,
        _ => None,
    }
}

fn set_tag_prop(tag: &mut TagSpecification, prop: &str, value: i64) {
    match prop {
        "filter_width" => tag.filter_width = Some(value),
        "filter_height" => tag.filter_height = Some(value),
        "filter_depth" => tag.filter_depth = Some(value),
        "housing_width" => tag.housing_width = Some(value),
        "housing_height" => tag.housing_height = Some(value),
        "airflow_m3h" => tag.airflow_m3h = Some(value),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Arc<TenantConfig> {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../config/tenants/hvac_filtration/config.yaml");
        Arc::new(TenantConfig::load(&path).unwrap())
    }

    fn state() -> TechnicalState {
        TechnicalState::new(cfg())
    }

    #[test]
    fn test_merge_creates_tag_with_mapping() {
        let mut s = state();
        let tag = s.merge_tag("item_1", TagPatch::dimensions(305, 610, None));
        assert_eq!(tag.filter_width, Some(305));
        assert_eq!(tag.housing_width, Some(300));
        assert_eq!(tag.housing_height, Some(600));
    }

    #[test]
    fn test_merge_updates_without_losing_fields() {
        let mut s = state();
        s.merge_tag("item_1", TagPatch::dimensions(600, 600, None));
        s.merge_tag(
            "item_1",
            TagPatch {
                airflow_m3h: Some(3000),
                ..Default::default()
            },
        );
        let tag = &s.tags["item_1"];
        assert_eq!(tag.airflow_m3h, Some(3000));
        assert_eq!(tag.housing_width, Some(600));
    }

    #[test]
    fn test_none_never_overwrites() {
        let mut s = state();
        s.merge_tag("item_1", TagPatch::dimensions(600, 600, None));
        s.merge_tag("item_1", TagPatch::default());
        assert_eq!(s.tags["item_1"].filter_width, Some(600));
    }

    #[test]
    fn test_merge_auto_derives_length_and_completeness() {
        let mut s = state();
        s.merge_tag(
            "item_1",
            TagPatch {
                filter_width: Some(600),
                filter_height: Some(600),
                filter_depth: Some(292),
                airflow_m3h: Some(3000),
                ..Default::default()
            },
        );
        let tag = &s.tags["item_1"];
        assert_eq!(tag.housing_length, Some(550));
        assert!(tag.is_complete);
    }

    #[test]
    fn test_lock_material_aliases_and_immutability() {
        let mut s = state();
        s.lock_material("stainless");
        assert_eq!(s.locked_material.as_deref(), Some("RF"));
        s.lock_material("FZ");
        assert_eq!(s.locked_material.as_deref(), Some("RF"));

        let mut s2 = state();
        s2.lock_material("TITANIUM");
        assert_eq!(s2.locked_material, None);
    }

    #[test]
    fn test_project_name_immutable() {
        let mut s = state();
        s.set_project("Hospital North");
        s.set_project("Something Else");
        assert_eq!(s.project_name.as_deref(), Some("Hospital North"));
    }

    #[test]
    fn test_all_tags_complete() {
        let mut s = state();
        assert!(!s.all_tags_complete());
        s.merge_tag(
            "item_1",
            TagPatch {
                filter_width: Some(600),
                filter_height: Some(600),
                filter_depth: Some(292),
                airflow_m3h: Some(3000),
                ..Default::default()
            },
        );
        assert!(s.all_tags_complete());
        s.merge_tag("item_2", TagPatch::dimensions(600, 600, None));
        assert!(!s.all_tags_complete());
    }

    #[test]
    fn test_build_product_code_with_template() {
        let mut s = state();
        s.lock_material("RF");
        s.resolved_params.insert("connection_type".into(), "PG".into());
        let mut tag = TagSpecification::new("t1");
        tag.housing_width = Some(300);
        tag.housing_height = Some(600);
        tag.housing_length = Some(550);
        tag.product_family = Some("GDB".into());
        let fmt = CodeFormatRow {
            fmt: Some("{family}-{width}x{height}-{length}-{side}-{connection}-{material}".into()),
            default_frame_depth: None,
        };
        assert_eq!(s.build_product_code(&tag, Some(&fmt)), "GDB-300x600-550-R-PG-RF");
    }

    #[test]
    fn test_build_product_code_defaults_and_overrides() {
        let s = state();
        let mut tag = TagSpecification::new("t1");
        tag.housing_width = Some(300);
        tag.housing_height = Some(600);
        tag.housing_length = Some(550);
        tag.product_family = Some("GDB".into());
        let fmt = CodeFormatRow {
            fmt: Some("{family}-{width}x{height}-{length}-{side}-{connection}-{material}".into()),
            default_frame_depth: None,
        };
        // Nothing locked → tenant default material
        assert!(s.build_product_code(&tag, Some(&fmt)).ends_with("-FZ"));

        let mut s2 = state();
        s2.lock_material("RF");
        tag.material_override = Some("AZ".into());
        assert!(s2.build_product_code(&tag, Some(&fmt)).ends_with("-AZ"));
    }

    #[test]
    fn test_build_product_code_connection_offset() {
        let mut s = state();
        s.lock_material("FZ");
        s.resolved_params.insert("connection_type".into(), "F".into());
        s.resolved_params
            .insert("connection_length_offset".into(), "50".into());
        let mut tag = TagSpecification::new("t1");
        tag.housing_width = Some(600);
        tag.housing_height = Some(600);
        tag.housing_length = Some(550);
        tag.product_family = Some("GDB".into());
        let fmt = CodeFormatRow {
            fmt: Some("{family}-{width}x{height}-{length}-{side}-{connection}-{material}".into()),
            default_frame_depth: None,
        };
        let code = s.build_product_code(&tag, Some(&fmt));
        assert!(code.contains("-600-"), "flange adds 50mm: {code}");
        assert!(code.contains("-F-"));
    }

    #[test]
    fn test_build_product_code_no_double_dashes() {
        let s = state();
        let mut tag = TagSpecification::new("t1");
        tag.housing_width = Some(300);
        tag.housing_height = Some(600);
        tag.product_family = Some("GDB".into());
        let fmt = CodeFormatRow {
            fmt: Some("{family}-{width}x{height}-{length}-{material}".into()),
            default_frame_depth: None,
        };
        let code = s.build_product_code(&tag, Some(&fmt));
        assert!(!code.contains("--"), "{code}");
    }

    #[test]
    fn test_build_product_code_frame_depth() {
        let mut s = state();
        s.lock_material("FZ");
        s.resolved_params.insert("frame_depth".into(), "50".into());
        let mut tag = TagSpecification::new("t1");
        tag.housing_width = Some(300);
        tag.housing_height = Some(600);
        tag.product_family = Some("GDP".into());
        let fmt = CodeFormatRow {
            fmt: Some("{family}-{width}x{height}-{frame_depth}-{material}".into()),
            default_frame_depth: None,
        };
        let code = s.build_product_code(&tag, Some(&fmt));
        assert_eq!(code, "GDP-300x600-50-FZ");
    }

    #[test]
    fn test_build_product_code_generic_fallback() {
        let s = state();
        let mut tag = TagSpecification::new("t1");
        tag.housing_width = Some(300);
        tag.housing_height = Some(600);
        tag.housing_length = Some(550);
        tag.product_family = Some("GDB".into());
        assert_eq!(s.build_product_code(&tag, None), "GDB-300x600-550");
    }

    #[test]
    fn test_verify_material_codes_rewrites_mismatch() {
        let mut s = state();
        s.lock_material("RF");
        s.merge_tag(
            "item_1",
            TagPatch {
                product_code: Some("GDB-600x600-550-R-PG-FZ".into()),
                ..Default::default()
            },
        );
        let warnings = s.verify_material_codes();
        assert_eq!(warnings.len(), 1);
        assert!(s.tags["item_1"]
            .product_code
            .as_deref()
            .unwrap()
            .ends_with("-RF"));

        // Clean pass produces no warnings
        let warnings = s.verify_material_codes();
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_verify_material_respects_override() {
        let mut s = state();
        s.lock_material("RF");
        s.merge_tag(
            "item_1",
            TagPatch {
                product_code: Some("GDB-600x600-550-R-PG-AZ".into()),
                material_override: Some("AZ".into()),
                ..Default::default()
            },
        );
        assert!(s.verify_material_codes().is_empty());
    }

    #[test]
    fn test_create_assembly_tags_shares_dims_and_removes_base() {
        let mut s = state();
        s.merge_tag(
            "item_1",
            TagPatch {
                filter_width: Some(600),
                filter_height: Some(600),
                filter_depth: Some(292),
                airflow_m3h: Some(3000),
                ..Default::default()
            },
        );
        let stages = vec![
            AssemblyStage {
                role: StageRole::Protector,
                product_family_id: "FAM_GDP".into(),
                product_family_name: "GDP".into(),
                provides_trait_id: "TRAIT_GREASE_PRE".into(),
                provides_trait_name: "Grease Pre-Filtration".into(),
                reason: "Pre-filters grease".into(),
            },
            AssemblyStage {
                role: StageRole::Target,
                product_family_id: "FAM_GDC".into(),
                product_family_name: "GDC".into(),
                provides_trait_id: "TRAIT_CARBON".into(),
                provides_trait_name: "Carbon Adsorption".into(),
                reason: "Main filtration".into(),
            },
        ];
        s.create_assembly_tags(&stages, "item_1");

        assert!(!s.tags.contains_key("item_1"));
        let s1 = &s.tags["item_1_stage_1"];
        let s2 = &s.tags["item_1_stage_2"];
        assert_eq!(s1.product_family.as_deref(), Some("GDP"));
        assert_eq!(s2.product_family.as_deref(), Some("GDC"));
        assert_eq!(s1.filter_width, s2.filter_width);
        assert_eq!(s1.airflow_m3h, Some(3000));
        assert_eq!(s2.airflow_m3h, Some(3000));
        // Each stage derives its own housing length from its family table
        assert_eq!(s1.housing_length, Some(550));
        assert_eq!(s2.housing_length, Some(750));
        assert_eq!(s.assembly_group.as_ref().unwrap().stages.len(), 2);
    }

    #[test]
    fn test_assembly_stage_names_strip_descriptive_suffix() {
        let mut s = state();
        s.merge_tag("item_1", TagPatch::dimensions(600, 600, Some(292)));
        let stages = vec![AssemblyStage {
            role: StageRole::Protector,
            product_family_id: "FAM_GDP".into(),
            product_family_name: "GDP Planfilter housing".into(),
            provides_trait_id: "T".into(),
            provides_trait_name: "Grease".into(),
            reason: String::new(),
        }];
        s.create_assembly_tags(&stages, "item_1");
        assert_eq!(
            s.tags["item_1_stage_1"].product_family.as_deref(),
            Some("GDP")
        );
    }

    #[test]
    fn test_snapshot_roundtrip_recomputes() {
        let mut s = state();
        s.set_project("Plant 7");
        s.lock_material("RF");
        s.resolved_params.insert("connection_type".into(), "PG".into());
        s.merge_tag(
            "item_1",
            TagPatch {
                filter_width: Some(600),
                filter_height: Some(600),
                filter_depth: Some(292),
                airflow_m3h: Some(3000),
                ..Default::default()
            },
        );
        let mut snap = s.to_snapshot();
        // Corrupt the stored flags; restore must recompute
        if let Some(tag) = snap.tags.get_mut("item_1") {
            tag.is_complete = false;
            tag.housing_width = None;
            tag.housing_height = None;
            tag.housing_length = None;
        }
        let restored = TechnicalState::from_snapshot(snap, cfg());
        let tag = &restored.tags["item_1"];
        assert!(tag.is_complete);
        assert_eq!(tag.housing_width, Some(600));
        assert_eq!(tag.housing_length, Some(550));
        assert_eq!(restored.locked_material.as_deref(), Some("RF"));
        assert_eq!(restored.resolved_params["connection_type"], "PG");
    }
}

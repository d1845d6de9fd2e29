//! In-memory labeled property graph backend
//!
//! Backs the full query surface with plain scans over nodes and labeled
//! edges. Used by the test suite and for cold-start development; semantics
//! match the Bolt backend (same merge rules, same sibling sync, same
//! default-deny accessory logic).

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use cpq_core::TagPatch;

use crate::error::{GraphError, GraphResult};
use crate::reader::GraphReader;
use crate::rows::*;
use crate::session::{
    GraphNode, GraphRel, ProjectRow, ProjectState, SessionGraph, SessionGraphData, TagRow,
    TurnRow,
};
use crate::{family_id, now_ms};

const MESSAGE_LIMIT: usize = 2000;
const IS_A_MAX_HOPS: usize = 5;

#[derive(Debug, Clone)]
struct Node {
    id: String,
    labels: Vec<String>,
    props: Map<String, Value>,
}

#[derive(Debug, Clone)]
struct Edge {
    from: String,
    rel: String,
    to: String,
    props: Map<String, Value>,
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<String, Node>,
    edges: Vec<Edge>,
}

/// In-memory labeled property graph
#[derive(Default)]
pub struct MemoryGraph {
    inner: RwLock<Inner>,
}

// ---------------------------------------------------------------------------
// property helpers
// ---------------------------------------------------------------------------

fn p_str(props: &Map<String, Value>, key: &str) -> Option<String> {
    props.get(key).and_then(|v| v.as_str()).map(String::from)
}

fn p_i64(props: &Map<String, Value>, key: &str) -> Option<i64> {
    props.get(key).and_then(Value::as_i64)
}

fn p_f64(props: &Map<String, Value>, key: &str) -> Option<f64> {
    props.get(key).and_then(Value::as_f64)
}

fn p_bool(props: &Map<String, Value>, key: &str) -> Option<bool> {
    props.get(key).and_then(Value::as_bool)
}

fn p_vec_str(props: &Map<String, Value>, key: &str) -> Vec<String> {
    props
        .get(key)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

fn as_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(m) => m,
        _ => Map::new(),
    }
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a node
    pub fn add_node(&self, label: &str, id: &str, props: Value) {
        let mut inner = self.inner.write();
        let mut map = as_object(props);
        map.entry("id".to_string())
            .or_insert_with(|| Value::String(id.to_string()));
        inner.nodes.insert(
            id.to_string(),
            Node {
                id: id.to_string(),
                labels: vec![label.to_string()],
                props: map,
            },
        );
    }

    /// Insert a directed labeled edge
    pub fn add_edge(&self, from: &str, rel: &str, to: &str, props: Value) {
        let mut inner = self.inner.write();
        inner.edges.push(Edge {
            from: from.to_string(),
            rel: rel.to_string(),
            to: to.to_string(),
            props: as_object(props),
        });
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().nodes.len()
    }

    fn nodes_with_label(inner: &Inner, label: &str) -> Vec<Node> {
        inner
            .nodes
            .values()
            .filter(|n| n.labels.iter().any(|l| l == label))
            .cloned()
            .collect()
    }

    fn out_edges(inner: &Inner, from: &str, rel: &str) -> Vec<Edge> {
        inner
            .edges
            .iter()
            .filter(|e| e.from == from && e.rel == rel)
            .cloned()
            .collect()
    }

    fn in_edges(inner: &Inner, to: &str, rel: &str) -> Vec<Edge> {
        inner
            .edges
            .iter()
            .filter(|e| e.to == to && e.rel == rel)
            .cloned()
            .collect()
    }

    /// Trait id sets for a family: (direct, via material)
    fn family_trait_ids(inner: &Inner, pf_id: &str) -> (Vec<String>, Vec<String>) {
        let direct: Vec<String> = Self::out_edges(inner, pf_id, "HAS_TRAIT")
            .iter()
            .map(|e| e.to.clone())
            .collect();
        let mut via_material = Vec::new();
        for mat_edge in Self::out_edges(inner, pf_id, "AVAILABLE_IN_MATERIAL") {
            for t in Self::out_edges(inner, &mat_edge.to, "PROVIDES_TRAIT") {
                if !via_material.contains(&t.to) {
                    via_material.push(t.to.clone());
                }
            }
        }
        (direct, via_material)
    }

    /// Trait qualification for alternative searches: the full closure
    /// (direct plus material-provided) must cover every required trait
    fn has_required_traits(inner: &Inner, pf_id: &str, required: &[String]) -> bool {
        if required.is_empty() {
            return true;
        }
        let (direct, material) = Self::family_trait_ids(inner, pf_id);
        let all: HashSet<&String> = direct.iter().chain(material.iter()).collect();
        required.iter().all(|t| all.contains(t))
    }

    fn stressor_row(node: &Node, matched: Vec<String>, source_context: Option<String>) -> StressorRow {
        StressorRow {
            id: node.id.clone(),
            name: p_str(&node.props, "name").unwrap_or_default(),
            description: p_str(&node.props, "description").unwrap_or_default(),
            category: p_str(&node.props, "category"),
            matched_keywords: matched,
            source_context,
        }
    }

    fn parameter_row(node: &Node, rule_name: Option<String>) -> ParameterRow {
        ParameterRow {
            param_id: node.id.clone(),
            name: p_str(&node.props, "name").unwrap_or_default(),
            property_key: p_str(&node.props, "property_key").unwrap_or_default(),
            priority: p_i64(&node.props, "priority").unwrap_or(1),
            question: p_str(&node.props, "question").unwrap_or_default(),
            unit: p_str(&node.props, "unit"),
            rule_name,
        }
    }

    fn gate_row(inner: &Inner, gate: &Node, context_id: Option<String>) -> Option<LogicGateRow> {
        let monitors = Self::out_edges(inner, &gate.id, "MONITORS");
        let stressor = monitors
            .first()
            .and_then(|e| inner.nodes.get(&e.to))?;
        let params = Self::out_edges(inner, &gate.id, "REQUIRES_DATA")
            .iter()
            .filter_map(|e| inner.nodes.get(&e.to))
            .map(|p| Self::parameter_row(p, None))
            .collect();
        Some(LogicGateRow {
            gate_id: gate.id.clone(),
            gate_name: p_str(&gate.props, "name").unwrap_or_default(),
            condition_logic: p_str(&gate.props, "condition_logic").unwrap_or_default(),
            physics_explanation: p_str(&gate.props, "physics_explanation").unwrap_or_default(),
            stressor_id: stressor.id.clone(),
            stressor_name: p_str(&stressor.props, "name").unwrap_or_default(),
            context_id,
            params,
        })
    }

    fn is_a_closure(inner: &Inner, start: &str) -> Vec<String> {
        let mut chain = vec![start.to_string()];
        let mut seen: HashSet<String> = chain.iter().cloned().collect();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();
        queue.push_back((start.to_string(), 0));
        while let Some((id, depth)) = queue.pop_front() {
            if depth >= IS_A_MAX_HOPS {
                continue;
            }
            for e in Self::out_edges(inner, &id, "IS_A") {
                if seen.insert(e.to.clone()) {
                    chain.push(e.to.clone());
                    queue.push_back((e.to, depth + 1));
                }
            }
        }
        chain
    }
}

// ---------------------------------------------------------------------------
// GraphReader
// ---------------------------------------------------------------------------

#[async_trait]
impl GraphReader for MemoryGraph {
    async fn get_stressors_by_keywords(
        &self,
        keywords: &[String],
    ) -> GraphResult<Vec<StressorRow>> {
        let inner = self.inner.read();
        let mut rows: Vec<(usize, StressorRow)> = Vec::new();
        for node in Self::nodes_with_label(&inner, "EnvironmentalStressor") {
            let node_keywords = p_vec_str(&node.props, "keywords");
            if node_keywords.is_empty() {
                continue;
            }
            let matched: Vec<String> = node_keywords
                .iter()
                .filter(|kw| {
                    let kw_lower = kw.to_lowercase();
                    keywords.iter().any(|q| {
                        let q_lower = q.to_lowercase();
                        q_lower == kw_lower
                            || (kw_lower.len() >= 3 && q_lower.starts_with(&kw_lower))
                    })
                })
                .cloned()
                .collect();
            if !matched.is_empty() {
                let count = matched.len();
                rows.push((count, Self::stressor_row(&node, matched, None)));
            }
        }
        rows.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(rows.into_iter().map(|(_, r)| r).collect())
    }

    async fn get_stressors_for_application(
        &self,
        app_id: &str,
    ) -> GraphResult<Vec<StressorRow>> {
        let inner = self.inner.read();
        let Some(ctx) = inner.nodes.get(app_id).cloned() else {
            return Ok(Vec::new());
        };
        let ctx_name = p_str(&ctx.props, "name");
        let mut seen = HashSet::new();
        let mut rows = Vec::new();
        for node_id in Self::is_a_closure(&inner, app_id) {
            for e in Self::out_edges(&inner, &node_id, "EXPOSES_TO") {
                if let Some(stressor) = inner.nodes.get(&e.to) {
                    if seen.insert(stressor.id.clone()) {
                        rows.push(Self::stressor_row(stressor, Vec::new(), ctx_name.clone()));
                    }
                }
            }
        }
        Ok(rows)
    }

    async fn resolve_environment_hierarchy(&self, env_id: &str) -> GraphResult<Vec<String>> {
        let inner = self.inner.read();
        if !inner.nodes.contains_key(env_id) {
            return Ok(vec![env_id.to_string()]);
        }
        Ok(Self::is_a_closure(&inner, env_id))
    }

    async fn get_environment_keywords(&self) -> GraphResult<BTreeMap<String, Vec<String>>> {
        let inner = self.inner.read();
        let mut out = BTreeMap::new();
        for node in Self::nodes_with_label(&inner, "Environment") {
            let keywords = p_vec_str(&node.props, "keywords");
            if !keywords.is_empty() {
                out.insert(node.id.clone(), keywords);
            }
        }
        Ok(out)
    }

    async fn get_all_applications(&self) -> GraphResult<Vec<ApplicationRow>> {
        let inner = self.inner.read();
        Ok(Self::nodes_with_label(&inner, "Application")
            .iter()
            .map(|n| ApplicationRow {
                id: n.id.clone(),
                name: p_str(&n.props, "name").unwrap_or_default(),
                keywords: p_vec_str(&n.props, "keywords"),
            })
            .collect())
    }

    async fn get_causal_rules_for_stressors(
        &self,
        stressor_ids: &[String],
    ) -> GraphResult<Vec<CausalRuleRow>> {
        if stressor_ids.is_empty() {
            return Ok(Vec::new());
        }
        let inner = self.inner.read();
        let ids: HashSet<&String> = stressor_ids.iter().collect();
        let mut rows = Vec::new();
        for edge in &inner.edges {
            let (rule_type, trait_id, stressor_id) = match edge.rel.as_str() {
                "NEUTRALIZED_BY" if ids.contains(&edge.to) => {
                    ("NEUTRALIZED_BY", &edge.from, &edge.to)
                }
                "DEMANDS_TRAIT" if ids.contains(&edge.from) => {
                    ("DEMANDS_TRAIT", &edge.to, &edge.from)
                }
                _ => continue,
            };
            let (Some(trait_node), Some(stressor_node)) =
                (inner.nodes.get(trait_id), inner.nodes.get(stressor_id))
            else {
                continue;
            };
            rows.push(CausalRuleRow {
                rule_type: rule_type.to_string(),
                trait_id: trait_node.id.clone(),
                trait_name: p_str(&trait_node.props, "name").unwrap_or_default(),
                stressor_id: stressor_node.id.clone(),
                stressor_name: p_str(&stressor_node.props, "name").unwrap_or_default(),
                severity: p_str(&edge.props, "severity").unwrap_or_default(),
                explanation: p_str(&edge.props, "explanation"),
            });
        }
        Ok(rows)
    }

    async fn get_all_product_families_with_traits(
        &self,
    ) -> GraphResult<Vec<ProductFamilyRow>> {
        let inner = self.inner.read();
        let mut rows: Vec<ProductFamilyRow> = Self::nodes_with_label(&inner, "ProductFamily")
            .iter()
            .map(|pf| {
                let (direct, material) = Self::family_trait_ids(&inner, &pf.id);
                let mut all = direct.clone();
                for t in &material {
                    if !all.contains(t) {
                        all.push(t.clone());
                    }
                }
                ProductFamilyRow {
                    product_id: pf.id.clone(),
                    product_name: p_str(&pf.props, "name").unwrap_or_default(),
                    selection_priority: p_i64(&pf.props, "selection_priority").unwrap_or(100),
                    direct_trait_ids: direct,
                    material_trait_ids: material,
                    all_trait_ids: all,
                }
            })
            .collect();
        rows.sort_by_key(|r| r.selection_priority);
        Ok(rows)
    }

    async fn get_product_traits(&self, family: &str) -> GraphResult<Vec<TraitRow>> {
        let inner = self.inner.read();
        let pf_id = family_id(family);
        let mut rows = Vec::new();
        for e in Self::out_edges(&inner, &pf_id, "HAS_TRAIT") {
            if let Some(t) = inner.nodes.get(&e.to) {
                rows.push(TraitRow {
                    id: t.id.clone(),
                    name: p_str(&t.props, "name").unwrap_or_default(),
                    source: "direct".into(),
                    is_primary: p_bool(&e.props, "primary").unwrap_or(false),
                });
            }
        }
        for mat_edge in Self::out_edges(&inner, &pf_id, "AVAILABLE_IN_MATERIAL") {
            let Some(mat) = inner.nodes.get(&mat_edge.to) else {
                continue;
            };
            let code = p_str(&mat.props, "code").unwrap_or_else(|| mat.id.clone());
            for e in Self::out_edges(&inner, &mat.id, "PROVIDES_TRAIT") {
                if let Some(t) = inner.nodes.get(&e.to) {
                    if rows.iter().any(|r: &TraitRow| r.id == t.id) {
                        continue;
                    }
                    rows.push(TraitRow {
                        id: t.id.clone(),
                        name: p_str(&t.props, "name").unwrap_or_default(),
                        source: code.clone(),
                        is_primary: false,
                    });
                }
            }
        }
        Ok(rows)
    }

    async fn get_hard_constraints(&self, family: &str) -> GraphResult<Vec<HardConstraintRow>> {
        let inner = self.inner.read();
        let pf_id = family_id(family);
        Ok(Self::out_edges(&inner, &pf_id, "HAS_HARD_CONSTRAINT")
            .iter()
            .filter_map(|e| inner.nodes.get(&e.to))
            .map(|n| HardConstraintRow {
                id: n.id.clone(),
                property_key: p_str(&n.props, "property_key").unwrap_or_default(),
                operator: p_str(&n.props, "operator").unwrap_or_else(|| ">=".into()),
                value: p_f64(&n.props, "value").unwrap_or(0.0),
                error_msg: p_str(&n.props, "error_msg").unwrap_or_default(),
            })
            .collect())
    }

    async fn get_installation_constraints(
        &self,
        family: &str,
    ) -> GraphResult<Vec<InstallationConstraintRow>> {
        let inner = self.inner.read();
        let pf_id = family_id(family);
        let Some(pf) = inner.nodes.get(&pf_id).cloned() else {
            return Ok(Vec::new());
        };
        Ok(Self::out_edges(&inner, &pf_id, "HAS_INSTALLATION_CONSTRAINT")
            .iter()
            .filter_map(|e| inner.nodes.get(&e.to))
            .map(|n| {
                let comparison_key = p_str(&n.props, "comparison_key");
                let product_property_value = comparison_key
                    .as_deref()
                    .and_then(|k| p_str(&pf.props, k));
                InstallationConstraintRow {
                    id: n.id.clone(),
                    constraint_type: p_str(&n.props, "constraint_type").unwrap_or_default(),
                    severity: p_str(&n.props, "severity").unwrap_or_default(),
                    error_msg: p_str(&n.props, "error_msg").unwrap_or_default(),
                    operator: p_str(&n.props, "operator"),
                    dimension_key: p_str(&n.props, "dimension_key"),
                    input_key: p_str(&n.props, "input_key"),
                    cross_property: p_str(&n.props, "cross_property"),
                    cross_rel_type: p_str(&n.props, "cross_rel_type"),
                    cross_node_match_property: p_str(&n.props, "cross_node_match_property"),
                    comparison_key,
                    material_context_key: p_str(&n.props, "material_context_key"),
                    context_match_key: p_str(&n.props, "context_match_key"),
                    valid_set: p_vec_str(&n.props, "valid_set"),
                    service_access_factor: p_f64(&pf.props, "service_access_factor"),
                    service_access_type: p_str(&pf.props, "service_access_type"),
                    allowed_environments: p_vec_str(&pf.props, "allowed_environments"),
                    product_property_value,
                }
            })
            .collect())
    }

    async fn get_variable_features(
        &self,
        family: &str,
    ) -> GraphResult<Vec<VariableFeatureRow>> {
        let inner = self.inner.read();
        let pf_id = family_id(family);
        Ok(Self::out_edges(&inner, &pf_id, "HAS_VARIABLE_FEATURE")
            .iter()
            .filter_map(|e| inner.nodes.get(&e.to))
            .map(|n| {
                let options = Self::out_edges(&inner, &n.id, "HAS_OPTION")
                    .iter()
                    .filter_map(|oe| inner.nodes.get(&oe.to))
                    .map(|o| FeatureOption {
                        value: p_str(&o.props, "value").unwrap_or_default(),
                        name: p_str(&o.props, "name").unwrap_or_default(),
                        display_label: p_str(&o.props, "display_label").unwrap_or_default(),
                        benefit: p_str(&o.props, "benefit").unwrap_or_default(),
                        is_default: p_bool(&o.props, "is_default").unwrap_or(false),
                        is_recommended: p_bool(&o.props, "is_recommended").unwrap_or(false),
                        min_required_housing_length: p_i64(&o.props, "min_required_housing_length"),
                        length_offset_mm: p_i64(&o.props, "length_offset_mm"),
                    })
                    .collect();
                VariableFeatureRow {
                    feature_id: n.id.clone(),
                    feature_name: p_str(&n.props, "feature_name").unwrap_or_default(),
                    parameter_name: p_str(&n.props, "parameter_name").unwrap_or_default(),
                    question: p_str(&n.props, "question").unwrap_or_default(),
                    why_needed: p_str(&n.props, "why_needed").unwrap_or_default(),
                    default_value: p_str(&n.props, "default_value"),
                    auto_resolve: p_bool(&n.props, "auto_resolve").unwrap_or(false),
                    options,
                }
            })
            .collect())
    }

    async fn get_capacity_rules(&self, family: &str) -> GraphResult<Vec<CapacityRuleRow>> {
        let inner = self.inner.read();
        let pf_id = family_id(family);
        Ok(Self::out_edges(&inner, &pf_id, "HAS_CAPACITY")
            .iter()
            .filter_map(|e| inner.nodes.get(&e.to))
            .map(|n| CapacityRuleRow {
                id: n.id.clone(),
                module_descriptor: p_str(&n.props, "module_descriptor").unwrap_or_default(),
                input_requirement: p_str(&n.props, "input_requirement").unwrap_or_default(),
                output_rating: p_f64(&n.props, "output_rating").unwrap_or(0.0),
                assumption: p_str(&n.props, "assumption"),
                description: p_str(&n.props, "description"),
                capacity_per_component: p_f64(&n.props, "capacity_per_component"),
                component_count_key: p_str(&n.props, "component_count_key"),
            })
            .collect())
    }

    async fn get_optimization_strategy(&self, family: &str) -> GraphResult<Option<StrategyRow>> {
        let inner = self.inner.read();
        let pf_id = family_id(family);
        Ok(Self::out_edges(&inner, &pf_id, "OPTIMIZATION_STRATEGY")
            .first()
            .and_then(|e| inner.nodes.get(&e.to))
            .map(|n| StrategyRow {
                id: n.id.clone(),
                name: p_str(&n.props, "name").unwrap_or_default(),
                sort_property: p_str(&n.props, "sort_property"),
                sort_order: p_str(&n.props, "sort_order"),
                primary_axis: p_str(&n.props, "primary_axis"),
                secondary_axis: p_str(&n.props, "secondary_axis"),
                expansion_unit: p_str(&n.props, "expansion_unit"),
                description: p_str(&n.props, "description"),
            }))
    }

    async fn get_logic_gates_for_stressors(
        &self,
        stressor_ids: &[String],
    ) -> GraphResult<Vec<LogicGateRow>> {
        if stressor_ids.is_empty() {
            return Ok(Vec::new());
        }
        let inner = self.inner.read();
        let ids: HashSet<&String> = stressor_ids.iter().collect();
        let mut rows = Vec::new();
        for gate in Self::nodes_with_label(&inner, "LogicGate") {
            let monitors_active = Self::out_edges(&inner, &gate.id, "MONITORS")
                .iter()
                .any(|e| ids.contains(&e.to));
            if monitors_active {
                if let Some(row) = Self::gate_row(&inner, &gate, None) {
                    rows.push(row);
                }
            }
        }
        rows.sort_by(|a, b| a.gate_id.cmp(&b.gate_id));
        Ok(rows)
    }

    async fn get_gates_triggered_by_context(
        &self,
        context_ids: &[String],
    ) -> GraphResult<Vec<LogicGateRow>> {
        if context_ids.is_empty() {
            return Ok(Vec::new());
        }
        let inner = self.inner.read();
        let mut rows = Vec::new();
        for ctx_id in context_ids {
            for e in Self::out_edges(&inner, ctx_id, "TRIGGERS_GATE") {
                if let Some(gate) = inner.nodes.get(&e.to) {
                    if let Some(row) = Self::gate_row(&inner, gate, Some(ctx_id.clone())) {
                        rows.push(row);
                    }
                }
            }
        }
        rows.sort_by(|a, b| a.gate_id.cmp(&b.gate_id));
        Ok(rows)
    }

    async fn get_dependency_rules_for_stressors(
        &self,
        stressor_ids: &[String],
    ) -> GraphResult<Vec<DependencyRuleRow>> {
        if stressor_ids.is_empty() {
            return Ok(Vec::new());
        }
        let inner = self.inner.read();
        let ids: HashSet<&String> = stressor_ids.iter().collect();
        let mut rows = Vec::new();
        for rule in Self::nodes_with_label(&inner, "DependencyRule") {
            let Some(stressor_edge) = Self::out_edges(&inner, &rule.id, "TRIGGERED_BY_STRESSOR")
                .into_iter()
                .find(|e| ids.contains(&e.to))
            else {
                continue;
            };
            let upstream = Self::out_edges(&inner, &rule.id, "UPSTREAM_REQUIRES_TRAIT")
                .first()
                .and_then(|e| inner.nodes.get(&e.to).cloned());
            let downstream = Self::out_edges(&inner, &rule.id, "DOWNSTREAM_PROVIDES_TRAIT")
                .first()
                .and_then(|e| inner.nodes.get(&e.to).cloned());
            let (Some(upstream), Some(downstream)) = (upstream, downstream) else {
                continue;
            };
            let stressor = inner.nodes.get(&stressor_edge.to).cloned();
            rows.push(DependencyRuleRow {
                id: rule.id.clone(),
                dependency_type: p_str(&rule.props, "dependency_type").unwrap_or_default(),
                description: p_str(&rule.props, "description").unwrap_or_default(),
                upstream_trait_id: upstream.id.clone(),
                upstream_trait_name: p_str(&upstream.props, "name").unwrap_or_default(),
                downstream_trait_id: downstream.id.clone(),
                downstream_trait_name: p_str(&downstream.props, "name").unwrap_or_default(),
                stressor_id: stressor_edge.to.clone(),
                stressor_name: stressor
                    .map(|s| p_str(&s.props, "name").unwrap_or_default())
                    .unwrap_or_default(),
                protector_family_id: p_str(&rule.props, "protector_family_id"),
                protector_family_name: p_str(&rule.props, "protector_family_name"),
            });
        }
        Ok(rows)
    }

    async fn get_required_parameters(&self, family: &str) -> GraphResult<Vec<ParameterRow>> {
        let inner = self.inner.read();
        let pf_id = family_id(family);
        let mut rows: Vec<ParameterRow> = Self::out_edges(&inner, &pf_id, "REQUIRES_PARAMETER")
            .iter()
            .filter_map(|e| inner.nodes.get(&e.to))
            .map(|n| Self::parameter_row(n, None))
            .collect();
        rows.sort_by_key(|r| r.priority);
        Ok(rows)
    }

    async fn get_contextual_clarifications(
        &self,
        application_id: &str,
        family: Option<&str>,
    ) -> GraphResult<Vec<ParameterRow>> {
        let inner = self.inner.read();
        let pf_id = family.map(family_id);
        let mut rows = Vec::new();
        for rule in Self::nodes_with_label(&inner, "ClarificationRule") {
            let triggered = Self::out_edges(&inner, &rule.id, "TRIGGERED_BY_CONTEXT")
                .iter()
                .any(|e| e.to == application_id);
            if !triggered {
                continue;
            }
            let applies_to = Self::out_edges(&inner, &rule.id, "APPLIES_TO_PRODUCT");
            if !applies_to.is_empty() {
                let matches_family = pf_id
                    .as_deref()
                    .map(|pf| applies_to.iter().any(|e| e.to == pf))
                    .unwrap_or(false);
                if !matches_family {
                    continue;
                }
            }
            let rule_name = p_str(&rule.props, "name");
            for e in Self::out_edges(&inner, &rule.id, "DEMANDS_PARAMETER") {
                if let Some(param) = inner.nodes.get(&e.to) {
                    rows.push(Self::parameter_row(param, rule_name.clone()));
                }
            }
        }
        rows.sort_by_key(|r| r.priority);
        Ok(rows)
    }

    async fn get_available_dimension_modules(
        &self,
        family: &str,
    ) -> GraphResult<Vec<DimensionModuleRow>> {
        let inner = self.inner.read();
        let pf_id = family_id(family);
        let mut rows: Vec<DimensionModuleRow> = Self::out_edges(&inner, &pf_id, "HAS_VARIANT")
            .iter()
            .filter_map(|e| inner.nodes.get(&e.to))
            .filter_map(|n| {
                Some(DimensionModuleRow {
                    id: n.id.clone(),
                    width_mm: p_i64(&n.props, "width_mm")?,
                    height_mm: p_i64(&n.props, "height_mm")?,
                    reference_airflow_m3h: p_i64(&n.props, "reference_airflow_m3h"),
                    label: p_str(&n.props, "label").unwrap_or_default(),
                })
            })
            .collect();
        rows.sort_by(|a, b| {
            b.reference_airflow_m3h
                .unwrap_or(0)
                .cmp(&a.reference_airflow_m3h.unwrap_or(0))
        });
        Ok(rows)
    }

    async fn get_reference_airflow_for_dimensions(
        &self,
        width_mm: i64,
        height_mm: i64,
        family: Option<&str>,
    ) -> GraphResult<Option<i64>> {
        let modules = match family {
            Some(f) => self.get_available_dimension_modules(f).await?,
            None => {
                let inner = self.inner.read();
                Self::nodes_with_label(&inner, "ProductVariant")
                    .iter()
                    .filter_map(|n| {
                        Some(DimensionModuleRow {
                            id: n.id.clone(),
                            width_mm: p_i64(&n.props, "width_mm")?,
                            height_mm: p_i64(&n.props, "height_mm")?,
                            reference_airflow_m3h: p_i64(&n.props, "reference_airflow_m3h"),
                            label: String::new(),
                        })
                    })
                    .collect()
            }
        };
        Ok(modules
            .iter()
            .find(|m| m.width_mm == width_mm && m.height_mm == height_mm)
            .and_then(|m| m.reference_airflow_m3h))
    }

    async fn get_variant_weight(
        &self,
        variant_name: &str,
        housing_length: Option<i64>,
    ) -> GraphResult<Option<f64>> {
        let inner = self.inner.read();
        for node in Self::nodes_with_label(&inner, "ProductVariant") {
            let name = p_str(&node.props, "name").unwrap_or_default();
            if name != variant_name {
                continue;
            }
            // Variant rows may carry short/long weights keyed by length.
            if let Some(len) = housing_length {
                let variant_len = p_i64(&node.props, "housing_length_mm");
                if let Some(vl) = variant_len {
                    if vl != len {
                        continue;
                    }
                }
            }
            return Ok(p_f64(&node.props, "weight_kg"));
        }
        Ok(None)
    }

    async fn get_dimension_module_weight(
        &self,
        width_mm: i64,
        height_mm: i64,
    ) -> GraphResult<Option<ModuleWeightRow>> {
        let inner = self.inner.read();
        for node in Self::nodes_with_label(&inner, "DimensionModule") {
            if p_i64(&node.props, "width_mm") == Some(width_mm)
                && p_i64(&node.props, "height_mm") == Some(height_mm)
            {
                if let Some(unit_weight) = p_f64(&node.props, "unit_weight_kg") {
                    return Ok(Some(ModuleWeightRow {
                        unit_weight_kg: unit_weight,
                        weight_per_mm_length: p_f64(&node.props, "weight_per_mm_length"),
                        reference_length_mm: p_i64(&node.props, "reference_length_mm"),
                    }));
                }
            }
        }
        Ok(None)
    }

    async fn get_product_family_code_format(
        &self,
        family: &str,
    ) -> GraphResult<Option<CodeFormatRow>> {
        let inner = self.inner.read();
        let pf_id = family_id(family);
        Ok(inner.nodes.get(&pf_id).map(|pf| CodeFormatRow {
            fmt: p_str(&pf.props, "code_format"),
            default_frame_depth: p_i64(&pf.props, "default_frame_depth"),
        }))
    }

    async fn get_accessory_compatibility(
        &self,
        accessory_code: &str,
        family: &str,
    ) -> GraphResult<AccessoryCompatRow> {
        let inner = self.inner.read();
        let pf_id = family_id(family);
        let accessory = Self::nodes_with_label(&inner, "Accessory")
            .into_iter()
            .find(|n| {
                p_str(&n.props, "code").as_deref() == Some(accessory_code)
                    || n.id == format!("ACC_{accessory_code}")
            });

        let Some(acc) = accessory else {
            return Ok(AccessoryCompatRow {
                accessory_code: accessory_code.to_string(),
                accessory_name: accessory_code.to_string(),
                product_family_id: pf_id,
                status: "UNKNOWN".into(),
                reason: Some("Accessory not present in engineering data".into()),
                compatible_alternatives: Vec::new(),
            });
        };

        let acc_name = p_str(&acc.props, "name").unwrap_or_else(|| accessory_code.to_string());
        let allowed = Self::out_edges(&inner, &pf_id, "HAS_COMPATIBLE_ACCESSORY")
            .iter()
            .any(|e| e.to == acc.id);
        if allowed {
            return Ok(AccessoryCompatRow {
                accessory_code: accessory_code.to_string(),
                accessory_name: acc_name,
                product_family_id: pf_id,
                status: "ALLOWED".into(),
                reason: None,
                compatible_alternatives: Vec::new(),
            });
        }

        let denied = Self::out_edges(&inner, &pf_id, "INCOMPATIBLE_WITH")
            .into_iter()
            .find(|e| e.to == acc.id);
        let alternatives: Vec<String> = Self::out_edges(&inner, &pf_id, "HAS_COMPATIBLE_ACCESSORY")
            .iter()
            .filter_map(|e| inner.nodes.get(&e.to))
            .filter_map(|n| p_str(&n.props, "code"))
            .collect();

        if let Some(deny_edge) = denied {
            return Ok(AccessoryCompatRow {
                accessory_code: accessory_code.to_string(),
                accessory_name: acc_name,
                product_family_id: pf_id,
                status: "BLOCKED".into(),
                reason: p_str(&deny_edge.props, "reason"),
                compatible_alternatives: alternatives,
            });
        }

        Ok(AccessoryCompatRow {
            accessory_code: accessory_code.to_string(),
            accessory_name: acc_name,
            product_family_id: pf_id,
            status: "NOT_ALLOWED".into(),
            reason: Some("No compatibility relationship in engineering data".into()),
            compatible_alternatives: alternatives,
        })
    }

    async fn get_all_accessory_codes(&self) -> GraphResult<Vec<AccessoryRow>> {
        let inner = self.inner.read();
        let mut rows: Vec<AccessoryRow> = Self::nodes_with_label(&inner, "Accessory")
            .iter()
            .map(|n| AccessoryRow {
                id: n.id.clone(),
                code: p_str(&n.props, "code")
                    .unwrap_or_else(|| n.id.trim_start_matches("ACC_").to_string()),
                name: p_str(&n.props, "name").unwrap_or_default(),
            })
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows)
    }

    async fn get_material_property(
        &self,
        family: &str,
        material_code: &str,
        property: &str,
    ) -> GraphResult<Option<f64>> {
        let inner = self.inner.read();
        let pf_id = family_id(family);
        for e in Self::out_edges(&inner, &pf_id, "AVAILABLE_IN_MATERIAL") {
            if let Some(mat) = inner.nodes.get(&e.to) {
                if p_str(&mat.props, "code").as_deref() == Some(material_code) {
                    return Ok(p_f64(&mat.props, property));
                }
            }
        }
        Ok(None)
    }

    async fn get_related_node_property(
        &self,
        family: &str,
        rel_type: &str,
        match_prop: &str,
        match_val: &Value,
        target_prop: &str,
    ) -> GraphResult<Option<Value>> {
        let inner = self.inner.read();
        let pf_id = family_id(family);
        for e in Self::out_edges(&inner, &pf_id, rel_type) {
            if let Some(node) = inner.nodes.get(&e.to) {
                if node.props.get(match_prop) == Some(match_val) {
                    return Ok(node.props.get(target_prop).cloned());
                }
            }
        }
        Ok(None)
    }

    async fn find_compatible_variants(
        &self,
        family: &str,
        rel_type: &str,
        match_prop: &str,
        threshold_prop: &str,
        min_threshold: f64,
    ) -> GraphResult<Vec<VariantThresholdRow>> {
        let inner = self.inner.read();
        let pf_id = family_id(family);
        let mut rows: Vec<VariantThresholdRow> = Self::out_edges(&inner, &pf_id, rel_type)
            .iter()
            .filter_map(|e| inner.nodes.get(&e.to))
            .filter_map(|n| {
                let threshold = p_f64(&n.props, threshold_prop)?;
                if threshold >= min_threshold {
                    Some(VariantThresholdRow {
                        variant_value: n.props.get(match_prop).cloned().unwrap_or(Value::Null),
                        threshold,
                    })
                } else {
                    None
                }
            })
            .collect();
        rows.sort_by(|a, b| a.threshold.partial_cmp(&b.threshold).unwrap_or(std::cmp::Ordering::Equal));
        Ok(rows)
    }

    async fn find_alternatives_for_space_constraint(
        &self,
        blocked_family: &str,
        dimension_key: &str,
        available_space: f64,
        dim_value: f64,
        required_trait_ids: &[String],
    ) -> GraphResult<Vec<ProductAltRow>> {
        let inner = self.inner.read();
        let blocked = family_id(blocked_family);
        let dim_prop = format!("{dimension_key}_mm");
        let mut rows = Vec::new();
        for pf in Self::nodes_with_label(&inner, "ProductFamily") {
            if pf.id == blocked {
                continue;
            }
            let Some(factor) = p_f64(&pf.props, "service_access_factor") else {
                continue;
            };
            let required_space = dim_value * (1.0 + factor);
            if required_space > available_space {
                continue;
            }
            let has_size = Self::out_edges(&inner, &pf.id, "HAS_VARIANT")
                .iter()
                .filter_map(|e| inner.nodes.get(&e.to))
                .any(|v| p_f64(&v.props, &dim_prop) == Some(dim_value));
            if !has_size {
                continue;
            }
            if !Self::has_required_traits(&inner, &pf.id, required_trait_ids) {
                continue;
            }
            let mut details = BTreeMap::new();
            details.insert("service_access_factor".into(), Value::from(factor));
            details.insert("required_space_mm".into(), Value::from(required_space));
            if let Some(t) = p_str(&pf.props, "service_access_type") {
                details.insert("service_access_type".into(), Value::String(t));
            }
            rows.push(ProductAltRow {
                product_id: pf.id.clone(),
                product_name: p_str(&pf.props, "name").unwrap_or_default(),
                selection_priority: p_i64(&pf.props, "selection_priority").unwrap_or(100),
                details,
            });
        }
        rows.sort_by_key(|r| r.selection_priority);
        Ok(rows)
    }

    async fn find_alternatives_for_environment_constraint(
        &self,
        blocked_family: &str,
        env_chain: &[String],
        required_trait_ids: &[String],
    ) -> GraphResult<Vec<ProductAltRow>> {
        let inner = self.inner.read();
        let blocked = family_id(blocked_family);
        let chain: BTreeSet<&String> = env_chain.iter().collect();
        let mut rows = Vec::new();
        for pf in Self::nodes_with_label(&inner, "ProductFamily") {
            if pf.id == blocked {
                continue;
            }
            let allowed = p_vec_str(&pf.props, "allowed_environments");
            if allowed.is_empty() || !allowed.iter().any(|env| chain.contains(env)) {
                continue;
            }
            if !Self::has_required_traits(&inner, &pf.id, required_trait_ids) {
                continue;
            }
            let mut details = BTreeMap::new();
            details.insert(
                "allowed_environments".into(),
                Value::Array(allowed.iter().cloned().map(Value::String).collect()),
            );
            rows.push(ProductAltRow {
                product_id: pf.id.clone(),
                product_name: p_str(&pf.props, "name").unwrap_or_default(),
                selection_priority: p_i64(&pf.props, "selection_priority").unwrap_or(100),
                details,
            });
        }
        rows.sort_by_key(|r| r.selection_priority);
        Ok(rows)
    }

    async fn find_material_alternatives_for_threshold(
        &self,
        family: &str,
        cross_property: &str,
        required_value: f64,
    ) -> GraphResult<Vec<MaterialAltRow>> {
        let inner = self.inner.read();
        let pf_id = family_id(family);
        let mut rows: Vec<MaterialAltRow> = Self::out_edges(&inner, &pf_id, "AVAILABLE_IN_MATERIAL")
            .iter()
            .filter_map(|e| inner.nodes.get(&e.to))
            .filter_map(|m| {
                let value = p_f64(&m.props, cross_property)?;
                if value >= required_value {
                    Some(MaterialAltRow {
                        material_code: p_str(&m.props, "code").unwrap_or_default(),
                        material_name: p_str(&m.props, "name").unwrap_or_default(),
                        threshold_value: value,
                    })
                } else {
                    None
                }
            })
            .collect();
        rows.sort_by(|a, b| {
            b.threshold_value
                .partial_cmp(&a.threshold_value)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(rows)
    }

    async fn find_other_products_for_material_threshold(
        &self,
        blocked_family: &str,
        cross_property: &str,
        required_value: f64,
        required_trait_ids: &[String],
    ) -> GraphResult<Vec<ProductAltRow>> {
        let inner = self.inner.read();
        let blocked = family_id(blocked_family);
        let mut rows = Vec::new();
        for pf in Self::nodes_with_label(&inner, "ProductFamily") {
            if pf.id == blocked {
                continue;
            }
            let qualifying: Vec<Value> = Self::out_edges(&inner, &pf.id, "AVAILABLE_IN_MATERIAL")
                .iter()
                .filter_map(|e| inner.nodes.get(&e.to))
                .filter_map(|m| {
                    let value = p_f64(&m.props, cross_property)?;
                    if value >= required_value {
                        Some(serde_json::json!({
                            "code": p_str(&m.props, "code").unwrap_or_default(),
                            "name": p_str(&m.props, "name").unwrap_or_default(),
                            "threshold": value,
                        }))
                    } else {
                        None
                    }
                })
                .collect();
            if qualifying.is_empty() {
                continue;
            }
            if !Self::has_required_traits(&inner, &pf.id, required_trait_ids) {
                continue;
            }
            let mut details = BTreeMap::new();
            details.insert("qualifying_materials".into(), Value::Array(qualifying));
            rows.push(ProductAltRow {
                product_id: pf.id.clone(),
                product_name: p_str(&pf.props, "name").unwrap_or_default(),
                selection_priority: p_i64(&pf.props, "selection_priority").unwrap_or(100),
                details,
            });
        }
        rows.sort_by_key(|r| r.selection_priority);
        Ok(rows)
    }

    async fn find_products_with_higher_capacity(
        &self,
        blocked_family: &str,
        module_descriptor: &str,
        min_output_rating: f64,
        required_trait_ids: &[String],
    ) -> GraphResult<Vec<CapacityAltRow>> {
        let inner = self.inner.read();
        let blocked = family_id(blocked_family);
        let mut rows = Vec::new();
        for pf in Self::nodes_with_label(&inner, "ProductFamily") {
            if pf.id == blocked {
                continue;
            }
            for e in Self::out_edges(&inner, &pf.id, "HAS_CAPACITY") {
                let Some(cr) = inner.nodes.get(&e.to) else {
                    continue;
                };
                if p_str(&cr.props, "module_descriptor").as_deref() != Some(module_descriptor) {
                    continue;
                }
                let rating = p_f64(&cr.props, "output_rating").unwrap_or(0.0);
                if rating <= min_output_rating {
                    continue;
                }
                if !Self::has_required_traits(&inner, &pf.id, required_trait_ids) {
                    continue;
                }
                rows.push(CapacityAltRow {
                    product_id: pf.id.clone(),
                    product_name: p_str(&pf.props, "name").unwrap_or_default(),
                    selection_priority: p_i64(&pf.props, "selection_priority").unwrap_or(100),
                    output_rating: rating,
                    description: p_str(&cr.props, "description"),
                });
            }
        }
        rows.sort_by_key(|r| r.selection_priority);
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// SessionGraph
// ---------------------------------------------------------------------------

fn project_id(session_id: &str) -> String {
    format!("APRJ_{session_id}")
}

fn tag_node_id(session_id: &str, tag_id: &str) -> String {
    format!("TAG_{session_id}_{tag_id}")
}

fn tag_row_from_props(props: &Map<String, Value>) -> TagRow {
    TagRow {
        tag_id: p_str(props, "tag_id").unwrap_or_default(),
        filter_width: p_i64(props, "filter_width"),
        filter_height: p_i64(props, "filter_height"),
        filter_depth: p_i64(props, "filter_depth"),
        housing_width: p_i64(props, "housing_width"),
        housing_height: p_i64(props, "housing_height"),
        housing_length: p_i64(props, "housing_length"),
        airflow_m3h: p_i64(props, "airflow_m3h"),
        product_family: p_str(props, "product_family"),
        product_code: p_str(props, "product_code"),
        weight_kg: p_f64(props, "weight_kg"),
        quantity: p_i64(props, "quantity"),
        modules_needed: p_i64(props, "modules_needed"),
        material_override: p_str(props, "material_override"),
        assembly_role: p_str(props, "assembly_role"),
        assembly_group_id: p_str(props, "assembly_group_id"),
        is_complete: p_bool(props, "is_complete").unwrap_or(false),
    }
}

fn patch_entries(patch: &TagPatch) -> Vec<(&'static str, Value)> {
    let mut out = Vec::new();
    let mut push_i64 = |key: &'static str, v: Option<i64>| {
        if let Some(v) = v {
            out.push((key, Value::from(v)));
        }
    };
    push_i64("filter_width", patch.filter_width);
    push_i64("filter_height", patch.filter_height);
    push_i64("filter_depth", patch.filter_depth);
    push_i64("housing_width", patch.housing_width);
    push_i64("housing_height", patch.housing_height);
    push_i64("housing_length", patch.housing_length);
    push_i64("airflow_m3h", patch.airflow_m3h);
    push_i64("quantity", patch.quantity);
    push_i64("modules_needed", patch.modules_needed);
    push_i64("source_turn", patch.source_turn);
    if let Some(v) = &patch.product_family {
        out.push(("product_family", Value::String(v.clone())));
    }
    if let Some(v) = &patch.product_code {
        out.push(("product_code", Value::String(v.clone())));
    }
    if let Some(v) = patch.weight_kg {
        out.push(("weight_kg", Value::from(v)));
    }
    if let Some(v) = &patch.material_override {
        out.push(("material_override", Value::String(v.clone())));
    }
    if let Some(v) = &patch.assembly_role {
        out.push(("assembly_role", Value::String(v.to_string())));
    }
    if let Some(v) = &patch.assembly_group_id {
        out.push(("assembly_group_id", Value::String(v.clone())));
    }
    out
}

impl MemoryGraph {
    fn ensure_session_nodes(inner: &mut Inner, session_id: &str, user_id: Option<&str>) {
        let now = now_ms();
        let session = inner
            .nodes
            .entry(session_id.to_string())
            .or_insert_with(|| Node {
                id: session_id.to_string(),
                labels: vec!["Session".into()],
                props: Map::new(),
            });
        if let Some(user) = user_id {
            session
                .props
                .insert("user_id".into(), Value::String(user.into()));
        }
        session.props.insert("last_active".into(), Value::from(now));
        session
            .props
            .entry("created_at".to_string())
            .or_insert_with(|| Value::from(now));

        let pid = project_id(session_id);
        inner.nodes.entry(pid.clone()).or_insert_with(|| {
            let mut props = Map::new();
            props.insert("session_id".into(), Value::String(session_id.into()));
            Node {
                id: pid.clone(),
                labels: vec!["ActiveProject".into()],
                props,
            }
        });
        let has_edge = inner
            .edges
            .iter()
            .any(|e| e.from == session_id && e.rel == "WORKING_ON" && e.to == pid);
        if !has_edge {
            inner.edges.push(Edge {
                from: session_id.to_string(),
                rel: "WORKING_ON".into(),
                to: pid,
                props: Map::new(),
            });
        }
    }

    fn set_project_prop(&self, session_id: &str, key: &str, value: Value) {
        let mut inner = self.inner.write();
        Self::ensure_session_nodes(&mut inner, session_id, None);
        let pid = project_id(session_id);
        if let Some(project) = inner.nodes.get_mut(&pid) {
            project.props.insert(key.to_string(), value);
        }
    }

    /// Re-link an exclusive relationship from the project to a catalog node,
    /// split into delete + (conditional) link like the Bolt backend does
    fn relink_project(&self, session_id: &str, rel: &str, target_id: Option<String>) {
        let mut inner = self.inner.write();
        let pid = project_id(session_id);
        inner.edges.retain(|e| !(e.from == pid && e.rel == rel));
        if let Some(target) = target_id {
            if inner.nodes.contains_key(&target) {
                inner.edges.push(Edge {
                    from: pid,
                    rel: rel.to_string(),
                    to: target,
                    props: Map::new(),
                });
            }
        }
    }
}

#[async_trait]
impl SessionGraph for MemoryGraph {
    async fn ensure_session(&self, session_id: &str, user_id: &str) -> GraphResult<()> {
        let mut inner = self.inner.write();
        Self::ensure_session_nodes(&mut inner, session_id, Some(user_id));
        Ok(())
    }

    async fn set_project(
        &self,
        session_id: &str,
        project_name: &str,
        customer: Option<&str>,
    ) -> GraphResult<()> {
        self.set_project_prop(session_id, "name", Value::String(project_name.into()));
        if let Some(customer) = customer {
            self.set_project_prop(session_id, "customer", Value::String(customer.into()));
        }
        Ok(())
    }

    async fn lock_material(&self, session_id: &str, material_code: &str) -> GraphResult<()> {
        let code = material_code.to_uppercase();
        self.set_project_prop(session_id, "locked_material", Value::String(code.clone()));
        let material_node = {
            let inner = self.inner.read();
            Self::nodes_with_label(&inner, "Material")
                .into_iter()
                .find(|n| p_str(&n.props, "code").as_deref() == Some(code.as_str()))
                .map(|n| n.id)
        };
        self.relink_project(session_id, "USES_MATERIAL", material_node);
        Ok(())
    }

    async fn set_detected_family(&self, session_id: &str, family: &str) -> GraphResult<()> {
        let family = family.to_uppercase();
        self.set_project_prop(session_id, "detected_family", Value::String(family.clone()));
        let target = family_id(&family);
        let exists = self.inner.read().nodes.contains_key(&target);
        self.relink_project(
            session_id,
            "TARGETS_FAMILY",
            if exists { Some(target) } else { None },
        );
        Ok(())
    }

    async fn set_pending_clarification(
        &self,
        session_id: &str,
        param_name: Option<&str>,
    ) -> GraphResult<()> {
        let value = match param_name {
            Some(p) => Value::String(p.into()),
            None => Value::Null,
        };
        self.set_project_prop(session_id, "pending_clarification", value);
        Ok(())
    }

    async fn set_accessories(&self, session_id: &str, accessories: &[String]) -> GraphResult<()> {
        self.set_project_prop(
            session_id,
            "accessories",
            Value::Array(accessories.iter().cloned().map(Value::String).collect()),
        );
        Ok(())
    }

    async fn set_assembly_group(&self, session_id: &str, assembly_json: &str) -> GraphResult<()> {
        self.set_project_prop(session_id, "assembly_group", Value::String(assembly_json.into()));
        Ok(())
    }

    async fn set_resolved_params(&self, session_id: &str, params_json: &str) -> GraphResult<()> {
        self.set_project_prop(session_id, "resolved_params", Value::String(params_json.into()));
        Ok(())
    }

    async fn set_vetoed_families(&self, session_id: &str, vetoed_json: &str) -> GraphResult<()> {
        self.set_project_prop(session_id, "vetoed_families", Value::String(vetoed_json.into()));
        Ok(())
    }

    async fn upsert_tag(
        &self,
        session_id: &str,
        tag_id: &str,
        patch: &TagPatch,
        sync_properties: &[String],
    ) -> GraphResult<TagRow> {
        let mut inner = self.inner.write();
        Self::ensure_session_nodes(&mut inner, session_id, None);
        let pid = project_id(session_id);
        let tid = tag_node_id(session_id, tag_id);

        {
            let tag = inner.nodes.entry(tid.clone()).or_insert_with(|| {
                let mut props = Map::new();
                props.insert("tag_id".into(), Value::String(tag_id.into()));
                props.insert("session_id".into(), Value::String(session_id.into()));
                Node {
                    id: tid.clone(),
                    labels: vec!["TagUnit".into()],
                    props,
                }
            });
            for (key, value) in patch_entries(patch) {
                tag.props.insert(key.to_string(), value);
            }
            let complete = tag.props.get("housing_width").map_or(false, |v| !v.is_null())
                && tag.props.get("housing_height").map_or(false, |v| !v.is_null())
                && tag.props.get("housing_length").map_or(false, |v| !v.is_null());
            tag.props.insert("is_complete".into(), Value::Bool(complete));
        }

        let has_unit = inner
            .edges
            .iter()
            .any(|e| e.from == pid && e.rel == "HAS_UNIT" && e.to == tid);
        if !has_unit {
            inner.edges.push(Edge {
                from: pid.clone(),
                rel: "HAS_UNIT".into(),
                to: tid.clone(),
                props: Map::new(),
            });
        }

        // Sibling sync: fill missing shared properties on assembly siblings.
        let group = inner
            .nodes
            .get(&tid)
            .and_then(|t| p_str(&t.props, "assembly_group_id"));
        if let Some(group) = group {
            let source: Vec<(String, Value)> = {
                let tag = inner.nodes.get(&tid).expect("tag just upserted");
                sync_properties
                    .iter()
                    .filter_map(|p| {
                        tag.props
                            .get(p)
                            .filter(|v| !v.is_null())
                            .map(|v| (p.clone(), v.clone()))
                    })
                    .collect()
            };
            let sibling_ids: Vec<String> = inner
                .edges
                .iter()
                .filter(|e| e.from == pid && e.rel == "HAS_UNIT" && e.to != tid)
                .map(|e| e.to.clone())
                .collect();
            for sid in sibling_ids {
                let Some(sibling) = inner.nodes.get_mut(&sid) else {
                    continue;
                };
                if p_str(&sibling.props, "assembly_group_id").as_deref() != Some(group.as_str()) {
                    continue;
                }
                for (key, value) in &source {
                    let missing = sibling
                        .props
                        .get(key)
                        .map(|v| v.is_null())
                        .unwrap_or(true);
                    if missing {
                        sibling.props.insert(key.clone(), value.clone());
                    }
                }
                let complete = sibling.props.get("housing_width").map_or(false, |v| !v.is_null())
                    && sibling.props.get("housing_height").map_or(false, |v| !v.is_null())
                    && sibling.props.get("housing_length").map_or(false, |v| !v.is_null());
                sibling.props.insert("is_complete".into(), Value::Bool(complete));
            }
        }

        // Link to the catalog dimension module, if one exists at this size.
        let (hw, hh) = {
            let tag = inner.nodes.get(&tid).expect("tag just upserted");
            (p_i64(&tag.props, "housing_width"), p_i64(&tag.props, "housing_height"))
        };
        if let (Some(w), Some(h)) = (hw, hh) {
            let dim_id = format!("DIM_{w}x{h}");
            inner.edges.retain(|e| !(e.from == tid && e.rel == "SIZED_AS"));
            if inner.nodes.contains_key(&dim_id) {
                inner.edges.push(Edge {
                    from: tid.clone(),
                    rel: "SIZED_AS".into(),
                    to: dim_id,
                    props: Map::new(),
                });
            }
        }

        let tag = inner.nodes.get(&tid).expect("tag just upserted");
        Ok(tag_row_from_props(&tag.props))
    }

    async fn get_project_state(&self, session_id: &str) -> GraphResult<ProjectState> {
        let inner = self.inner.read();
        let pid = project_id(session_id);
        let project = inner.nodes.get(&pid).map(|p| ProjectRow {
            name: p_str(&p.props, "name"),
            customer: p_str(&p.props, "customer"),
            locked_material: p_str(&p.props, "locked_material"),
            detected_family: p_str(&p.props, "detected_family"),
            pending_clarification: p_str(&p.props, "pending_clarification"),
            accessories: p_vec_str(&p.props, "accessories"),
            resolved_params: p_str(&p.props, "resolved_params"),
            assembly_group: p_str(&p.props, "assembly_group"),
            vetoed_families: p_str(&p.props, "vetoed_families"),
        });
        let mut tags: Vec<TagRow> = Self::out_edges(&inner, &pid, "HAS_UNIT")
            .iter()
            .filter_map(|e| inner.nodes.get(&e.to))
            .map(|t| tag_row_from_props(&t.props))
            .collect();
        tags.sort_by(|a, b| a.tag_id.cmp(&b.tag_id));
        let tag_count = tags.len();
        Ok(ProjectState {
            session_id: session_id.to_string(),
            project,
            tags,
            tag_count,
        })
    }

    async fn store_turn(
        &self,
        session_id: &str,
        role: &str,
        message: &str,
        turn_number: i64,
        at_ms: i64,
    ) -> GraphResult<()> {
        let mut inner = self.inner.write();
        Self::ensure_session_nodes(&mut inner, session_id, None);
        let pid = project_id(session_id);
        let turn_id = format!("TURN_{session_id}_{turn_number}_{role}");

        if let Some(existing) = inner.nodes.get(&turn_id) {
            let created = p_i64(&existing.props, "created_at").unwrap_or(0);
            if created > at_ms {
                return Err(GraphError::StaleWrite(format!(
                    "turn {turn_id} already written at {created}"
                )));
            }
        }

        let truncated: String = message.chars().take(MESSAGE_LIMIT).collect();
        let turn = inner.nodes.entry(turn_id.clone()).or_insert_with(|| Node {
            id: turn_id.clone(),
            labels: vec!["ConversationTurn".into()],
            props: Map::new(),
        });
        turn.props.insert("role".into(), Value::String(role.into()));
        turn.props.insert("message".into(), Value::String(truncated));
        turn.props.insert("turn_number".into(), Value::from(turn_number));
        turn.props
            .entry("created_at".to_string())
            .or_insert_with(|| Value::from(at_ms));

        let has_edge = inner
            .edges
            .iter()
            .any(|e| e.from == pid && e.rel == "HAS_TURN" && e.to == turn_id);
        if !has_edge {
            inner.edges.push(Edge {
                from: pid,
                rel: "HAS_TURN".into(),
                to: turn_id,
                props: Map::new(),
            });
        }
        Ok(())
    }

    async fn get_recent_turns(&self, session_id: &str, n: usize) -> GraphResult<Vec<TurnRow>> {
        let inner = self.inner.read();
        let pid = project_id(session_id);
        let mut turns: Vec<TurnRow> = Self::out_edges(&inner, &pid, "HAS_TURN")
            .iter()
            .filter_map(|e| inner.nodes.get(&e.to))
            .map(|t| TurnRow {
                role: p_str(&t.props, "role").unwrap_or_default(),
                message: p_str(&t.props, "message").unwrap_or_default(),
                turn_number: p_i64(&t.props, "turn_number").unwrap_or(0),
                created_at: p_i64(&t.props, "created_at").unwrap_or(0),
                judge_results: p_str(&t.props, "judge_results"),
            })
            .collect();
        turns.sort_by_key(|t| std::cmp::Reverse(t.turn_number));
        turns.truncate(n);
        turns.reverse();
        Ok(turns)
    }

    async fn clear_session(&self, session_id: &str) -> GraphResult<()> {
        let mut inner = self.inner.write();
        let pid = project_id(session_id);
        let mut doomed: HashSet<String> = HashSet::new();
        doomed.insert(session_id.to_string());
        doomed.insert(pid.clone());
        for e in &inner.edges {
            if e.from == pid && (e.rel == "HAS_UNIT" || e.rel == "HAS_TURN") {
                doomed.insert(e.to.clone());
            }
        }
        inner.nodes.retain(|id, _| !doomed.contains(id));
        inner
            .edges
            .retain(|e| !doomed.contains(&e.from) && !doomed.contains(&e.to));
        tracing::info!(session_id = %session_id, "cleared session subgraph");
        Ok(())
    }

    async fn cleanup_stale_sessions(&self, max_age_ms: i64) -> GraphResult<u64> {
        let cutoff = now_ms() - max_age_ms;
        let stale: Vec<String> = {
            let inner = self.inner.read();
            Self::nodes_with_label(&inner, "Session")
                .iter()
                .filter(|s| p_i64(&s.props, "last_active").unwrap_or(0) < cutoff)
                .map(|s| s.id.clone())
                .collect()
        };
        let count = stale.len() as u64;
        for sid in stale {
            self.clear_session(&sid).await?;
        }
        if count > 0 {
            tracing::info!(count, "cleaned stale sessions");
        }
        Ok(count)
    }

    async fn get_session_graph_data(&self, session_id: &str) -> GraphResult<SessionGraphData> {
        let inner = self.inner.read();
        let pid = project_id(session_id);
        let mut data = SessionGraphData::default();
        let mut seen: HashSet<String> = HashSet::new();

        let mut push_node = |data: &mut SessionGraphData, seen: &mut HashSet<String>, node: &Node, name: String| {
            if seen.insert(node.id.clone()) {
                data.nodes.push(GraphNode {
                    id: node.id.clone(),
                    labels: node.labels.clone(),
                    name,
                    properties: Value::Object(node.props.clone()),
                });
            }
        };

        let Some(session) = inner.nodes.get(session_id) else {
            return Ok(data);
        };
        push_node(&mut data, &mut seen, session, format!("Session: {session_id}"));

        let mut follow: Vec<(String, String)> = vec![(session_id.to_string(), "WORKING_ON".into())];
        while let Some((from, rel)) = follow.pop() {
            for (idx, edge) in inner.edges.iter().enumerate() {
                if edge.from != from || edge.rel != rel {
                    continue;
                }
                let Some(target) = inner.nodes.get(&edge.to) else {
                    continue;
                };
                let name = p_str(&target.props, "name")
                    .or_else(|| p_str(&target.props, "tag_id").map(|t| format!("Tag {t}")))
                    .or_else(|| p_str(&target.props, "label"))
                    .or_else(|| p_str(&target.props, "code"))
                    .unwrap_or_else(|| target.id.clone());
                push_node(&mut data, &mut seen, target, name);
                data.relationships.push(GraphRel {
                    id: format!("e{idx}"),
                    rel_type: edge.rel.clone(),
                    source: edge.from.clone(),
                    target: edge.to.clone(),
                });
                if edge.to == pid {
                    for next in ["HAS_UNIT", "USES_MATERIAL", "TARGETS_FAMILY"] {
                        follow.push((pid.clone(), next.into()));
                    }
                } else if target.labels.iter().any(|l| l == "TagUnit") {
                    follow.push((target.id.clone(), "SIZED_AS".into()));
                }
            }
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with_env_hierarchy() -> MemoryGraph {
        let g = MemoryGraph::new();
        g.add_node("Environment", "ENV_INDOOR", serde_json::json!({"name": "Indoor"}));
        g.add_node("Environment", "ENV_KITCHEN", serde_json::json!({"name": "Kitchen"}));
        g.add_node("Environment", "ENV_OUTDOOR", serde_json::json!({"name": "Outdoor"}));
        g.add_edge("ENV_KITCHEN", "IS_A", "ENV_INDOOR", serde_json::json!({}));
        g
    }

    #[tokio::test]
    async fn test_environment_hierarchy_includes_parents() {
        let g = graph_with_env_hierarchy();
        let chain = g.resolve_environment_hierarchy("ENV_KITCHEN").await.unwrap();
        assert_eq!(chain, vec!["ENV_KITCHEN", "ENV_INDOOR"]);

        let chain = g.resolve_environment_hierarchy("ENV_OUTDOOR").await.unwrap();
        assert_eq!(chain, vec!["ENV_OUTDOOR"]);

        // Unknown environment resolves to itself
        let chain = g.resolve_environment_hierarchy("ENV_MARS").await.unwrap();
        assert_eq!(chain, vec!["ENV_MARS"]);
    }

    #[tokio::test]
    async fn test_keyword_stressor_match() {
        let g = MemoryGraph::new();
        g.add_node(
            "EnvironmentalStressor",
            "STR_CHLORINE",
            serde_json::json!({
                "name": "Chlorine Vapor",
                "description": "Chlorine attack",
                "category": "chlorine",
                "keywords": ["chlorine", "pool"],
            }),
        );
        let hits = g
            .get_stressors_by_keywords(&["pool".into(), "facility".into()])
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "STR_CHLORINE");
        assert_eq!(hits[0].matched_keywords, vec!["pool"]);

        let none = g.get_stressors_by_keywords(&["office".into()]).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_tag_merges_and_never_blanks() {
        let g = MemoryGraph::new();
        g.ensure_session("s1", "tester").await.unwrap();

        let patch = TagPatch {
            filter_width: Some(600),
            filter_height: Some(600),
            housing_width: Some(600),
            housing_height: Some(600),
            ..Default::default()
        };
        let tag = g.upsert_tag("s1", "item_1", &patch, &[]).await.unwrap();
        assert_eq!(tag.housing_width, Some(600));
        assert!(!tag.is_complete);

        // A later patch with only airflow preserves the dimensions.
        let patch = TagPatch {
            airflow_m3h: Some(3000),
            housing_length: Some(550),
            ..Default::default()
        };
        let tag = g.upsert_tag("s1", "item_1", &patch, &[]).await.unwrap();
        assert_eq!(tag.housing_width, Some(600));
        assert_eq!(tag.airflow_m3h, Some(3000));
        assert!(tag.is_complete);

        // An empty patch changes nothing.
        let tag = g
            .upsert_tag("s1", "item_1", &TagPatch::default(), &[])
            .await
            .unwrap();
        assert_eq!(tag.airflow_m3h, Some(3000));
        assert!(tag.is_complete);
    }

    #[tokio::test]
    async fn test_sibling_sync_fills_missing_only() {
        let g = MemoryGraph::new();
        g.ensure_session("s1", "tester").await.unwrap();
        let sync: Vec<String> = vec!["filter_width".into(), "airflow_m3h".into()];

        let stage2 = TagPatch {
            assembly_group_id: Some("assembly_item_1".into()),
            housing_length: Some(750),
            ..Default::default()
        };
        g.upsert_tag("s1", "item_1_stage_2", &stage2, &sync).await.unwrap();

        let stage1 = TagPatch {
            assembly_group_id: Some("assembly_item_1".into()),
            filter_width: Some(600),
            airflow_m3h: Some(3000),
            housing_length: Some(550),
            ..Default::default()
        };
        g.upsert_tag("s1", "item_1_stage_1", &stage1, &sync).await.unwrap();

        let state = g.get_project_state("s1").await.unwrap();
        let s2 = state
            .tags
            .iter()
            .find(|t| t.tag_id == "item_1_stage_2")
            .unwrap();
        assert_eq!(s2.filter_width, Some(600));
        assert_eq!(s2.airflow_m3h, Some(3000));
        // housing_length is NOT in the sync list and stays per-stage
        assert_eq!(s2.housing_length, Some(750));
    }

    #[tokio::test]
    async fn test_store_turn_idempotent_and_rejects_stale() {
        let g = MemoryGraph::new();
        g.ensure_session("s1", "tester").await.unwrap();
        g.store_turn("s1", "user", "hello", 1, 1000).await.unwrap();
        // Replay at a later timestamp is fine (idempotent merge)
        g.store_turn("s1", "user", "hello", 1, 2000).await.unwrap();
        let turns = g.get_recent_turns("s1", 5).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].created_at, 1000);

        // A rewrite older than the stored turn is rejected
        let err = g.store_turn("s1", "user", "rewritten", 1, 500).await;
        assert!(matches!(err, Err(GraphError::StaleWrite(_))));
    }

    #[tokio::test]
    async fn test_turn_message_truncated() {
        let g = MemoryGraph::new();
        g.ensure_session("s1", "tester").await.unwrap();
        let long = "x".repeat(5000);
        g.store_turn("s1", "user", &long, 1, 1000).await.unwrap();
        let turns = g.get_recent_turns("s1", 1).await.unwrap();
        assert_eq!(turns[0].message.len(), 2000);
    }

    #[tokio::test]
    async fn test_recent_turns_chronological() {
        let g = MemoryGraph::new();
        g.ensure_session("s1", "tester").await.unwrap();
        for n in 1..=5 {
            g.store_turn("s1", "user", &format!("m{n}"), n, 1000 + n)
                .await
                .unwrap();
        }
        let turns = g.get_recent_turns("s1", 3).await.unwrap();
        let numbers: Vec<i64> = turns.iter().map(|t| t.turn_number).collect();
        assert_eq!(numbers, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_clear_session_removes_subgraph() {
        let g = MemoryGraph::new();
        g.ensure_session("s1", "tester").await.unwrap();
        g.upsert_tag("s1", "item_1", &TagPatch::dimensions(600, 600, None), &[])
            .await
            .unwrap();
        g.store_turn("s1", "user", "hi", 1, 1000).await.unwrap();
        g.clear_session("s1").await.unwrap();
        let state = g.get_project_state("s1").await.unwrap();
        assert!(state.project.is_none());
        assert!(state.tags.is_empty());
    }

    #[tokio::test]
    async fn test_accessory_default_deny() {
        let g = MemoryGraph::new();
        g.add_node("ProductFamily", "FAM_GDC", serde_json::json!({"name": "GDC"}));
        g.add_node("Accessory", "ACC_EXL", serde_json::json!({"code": "EXL", "name": "Eccentric lock"}));
        g.add_node("Accessory", "ACC_Bayonet", serde_json::json!({"code": "Bayonet", "name": "Bayonet mount"}));
        g.add_edge("FAM_GDC", "HAS_COMPATIBLE_ACCESSORY", "ACC_Bayonet", serde_json::json!({}));

        // No edge either way → NOT_ALLOWED with alternatives
        let row = g.get_accessory_compatibility("EXL", "GDC").await.unwrap();
        assert_eq!(row.status, "NOT_ALLOWED");
        assert_eq!(row.compatible_alternatives, vec!["Bayonet"]);

        // Unknown accessory
        let row = g.get_accessory_compatibility("XYZ", "GDC").await.unwrap();
        assert_eq!(row.status, "UNKNOWN");

        // Explicit allow
        let row = g.get_accessory_compatibility("Bayonet", "GDC").await.unwrap();
        assert_eq!(row.status, "ALLOWED");
    }
}

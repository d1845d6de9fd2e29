//! Bolt-protocol graph backend
//!
//! Cypher here is the only backend-specific surface in the system. Two
//! portability rules hold throughout:
//! - no vendor-specific conditional subqueries: conditional linking is a
//!   separate `MATCH … MERGE` statement that simply matches zero rows when
//!   the target is absent;
//! - enum-valued edge properties come back as raw strings and are validated
//!   by the engine, not trusted here.

use std::collections::BTreeMap;

use async_trait::async_trait;
use neo4rs::{query, Graph, Query, Row};
use serde_json::Value;

use cpq_core::TagPatch;

use crate::error::{GraphError, GraphResult};
use crate::reader::GraphReader;
use crate::retry::RetryPolicy;
use crate::rows::*;
use crate::session::{
    GraphNode, GraphRel, ProjectRow, ProjectState, SessionGraph, SessionGraphData, TagRow,
    TurnRow,
};
use crate::{family_id, now_ms};

const MESSAGE_LIMIT: usize = 2000;

/// Bolt-backed graph store
pub struct Neo4jGraph {
    graph: Graph,
    retry: RetryPolicy,
}

// Row extraction helpers. Missing or null columns degrade to the empty shape;
// schema-invariant checks happen in the engine.
fn s(row: &Row, key: &str) -> String {
    row.get::<String>(key).unwrap_or_default()
}

fn so(row: &Row, key: &str) -> Option<String> {
    row.get::<Option<String>>(key).ok().flatten()
}

fn io(row: &Row, key: &str) -> Option<i64> {
    row.get::<Option<i64>>(key).ok().flatten()
}

fn fo(row: &Row, key: &str) -> Option<f64> {
    row.get::<Option<f64>>(key).ok().flatten()
}

fn bo(row: &Row, key: &str) -> Option<bool> {
    row.get::<Option<bool>>(key).ok().flatten()
}

fn vs(row: &Row, key: &str) -> Vec<String> {
    row.get::<Option<Vec<String>>>(key).ok().flatten().unwrap_or_default()
}

impl Neo4jGraph {
    /// Connect to the graph database
    pub async fn connect(
        uri: &str,
        user: &str,
        password: &str,
        retry: RetryPolicy,
    ) -> GraphResult<Self> {
        tracing::info!(uri = %uri, "connecting to graph database");
        let graph = Graph::new(uri, user, password)
            .await
            .map_err(|e| GraphError::Unavailable(format!("connect failed: {e}")))?;
        Ok(Self { graph, retry })
    }

    async fn rows<F>(&self, build: F) -> GraphResult<Vec<Row>>
    where
        F: Fn() -> Query,
    {
        self.retry
            .run(|| async {
                let mut stream = self.graph.execute(build()).await?;
                let mut rows = Vec::new();
                while let Some(row) = stream.next().await? {
                    rows.push(row);
                }
                Ok(rows)
            })
            .await
    }

    async fn run<F>(&self, build: F) -> GraphResult<()>
    where
        F: Fn() -> Query,
    {
        self.retry
            .run(|| async {
                self.graph.run(build()).await?;
                Ok(())
            })
            .await
    }

    fn parameter_rows(row: &Row, key: &str) -> Vec<ParameterRow> {
        row.get::<Option<Vec<ParameterRow>>>(key)
            .ok()
            .flatten()
            .unwrap_or_default()
            .into_iter()
            .filter(|p| !p.param_id.is_empty())
            .collect()
    }

    fn gate_row(row: &Row) -> LogicGateRow {
        LogicGateRow {
            gate_id: s(row, "gate_id"),
            gate_name: s(row, "gate_name"),
            condition_logic: so(row, "condition_logic").unwrap_or_default(),
            physics_explanation: so(row, "physics_explanation").unwrap_or_default(),
            stressor_id: s(row, "stressor_id"),
            stressor_name: s(row, "stressor_name"),
            context_id: so(row, "context_id"),
            params: Self::parameter_rows(row, "params"),
        }
    }

    fn stressor_row(row: &Row) -> StressorRow {
        StressorRow {
            id: s(row, "id"),
            name: s(row, "name"),
            description: so(row, "description").unwrap_or_default(),
            category: so(row, "category"),
            matched_keywords: vs(row, "matched_keywords"),
            source_context: so(row, "source_context"),
        }
    }
}

#[async_trait]
impl GraphReader for Neo4jGraph {
    async fn get_stressors_by_keywords(
        &self,
        keywords: &[String],
    ) -> GraphResult<Vec<StressorRow>> {
        let kws = keywords.to_vec();
        let rows = self
            .rows(|| {
                query(
                    "MATCH (s:EnvironmentalStressor)
                     WHERE s.keywords IS NOT NULL
                     WITH s, [kw IN s.keywords WHERE ANY(qkw IN $keywords WHERE
                         toLower(qkw) = toLower(kw)
                         OR (size(kw) >= 3 AND toLower(qkw) STARTS WITH toLower(kw))
                     )] AS matched
                     WHERE size(matched) > 0
                     RETURN s.id AS id, s.name AS name, s.description AS description,
                            s.category AS category, matched AS matched_keywords,
                            size(matched) AS match_count
                     ORDER BY match_count DESC",
                )
                .param("keywords", kws.clone())
            })
            .await?;
        Ok(rows.iter().map(Self::stressor_row).collect())
    }

    async fn get_stressors_for_application(
        &self,
        app_id: &str,
    ) -> GraphResult<Vec<StressorRow>> {
        let rows = self
            .rows(|| {
                query(
                    "MATCH (ctx {id: $app_id})
                     OPTIONAL MATCH (ctx)-[:IS_A*0..5]->(c)
                     WITH ctx, [x IN collect(DISTINCT c) WHERE x IS NOT NULL] + [ctx] AS contexts
                     UNWIND contexts AS node
                     MATCH (node)-[:EXPOSES_TO]->(s:EnvironmentalStressor)
                     RETURN DISTINCT s.id AS id, s.name AS name,
                            s.description AS description, s.category AS category,
                            ctx.name AS source_context",
                )
                .param("app_id", app_id)
            })
            .await?;
        Ok(rows.iter().map(Self::stressor_row).collect())
    }

    async fn resolve_environment_hierarchy(&self, env_id: &str) -> GraphResult<Vec<String>> {
        let rows = self
            .rows(|| {
                query(
                    "MATCH (env:Environment {id: $env_id})
                     OPTIONAL MATCH (env)-[:IS_A*0..5]->(parent:Environment)
                     RETURN collect(DISTINCT env.id) + collect(DISTINCT parent.id) AS env_chain",
                )
                .param("env_id", env_id)
            })
            .await?;
        let chain = rows
            .first()
            .map(|r| vs(r, "env_chain"))
            .unwrap_or_default();
        if chain.is_empty() {
            return Ok(vec![env_id.to_string()]);
        }
        let mut deduped = Vec::new();
        for id in chain {
            if !deduped.contains(&id) {
                deduped.push(id);
            }
        }
        Ok(deduped)
    }

    async fn get_environment_keywords(&self) -> GraphResult<BTreeMap<String, Vec<String>>> {
        let rows = self
            .rows(|| {
                query(
                    "MATCH (env:Environment)
                     WHERE env.keywords IS NOT NULL
                     RETURN env.id AS env_id, env.keywords AS keywords",
                )
            })
            .await?;
        Ok(rows
            .iter()
            .map(|r| (s(r, "env_id"), vs(r, "keywords")))
            .collect())
    }

    async fn get_all_applications(&self) -> GraphResult<Vec<ApplicationRow>> {
        let rows = self
            .rows(|| {
                query(
                    "MATCH (a:Application)
                     RETURN a.id AS id, a.name AS name, a.keywords AS keywords",
                )
            })
            .await?;
        Ok(rows
            .iter()
            .map(|r| ApplicationRow {
                id: s(r, "id"),
                name: s(r, "name"),
                keywords: vs(r, "keywords"),
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
        let ids = stressor_ids.to_vec();
        let rows = self
            .rows(|| {
                query(
                    "MATCH (t:PhysicalTrait)-[r:NEUTRALIZED_BY]->(s:EnvironmentalStressor)
                     WHERE s.id IN $stressor_ids
                     RETURN 'NEUTRALIZED_BY' AS rule_type,
                            t.id AS trait_id, t.name AS trait_name,
                            s.id AS stressor_id, s.name AS stressor_name,
                            r.severity AS severity, r.explanation AS explanation
                     UNION ALL
                     MATCH (s:EnvironmentalStressor)-[r:DEMANDS_TRAIT]->(t:PhysicalTrait)
                     WHERE s.id IN $stressor_ids
                     RETURN 'DEMANDS_TRAIT' AS rule_type,
                            t.id AS trait_id, t.name AS trait_name,
                            s.id AS stressor_id, s.name AS stressor_name,
                            r.severity AS severity, r.explanation AS explanation",
                )
                .param("stressor_ids", ids.clone())
            })
            .await?;
        Ok(rows
            .iter()
            .map(|r| CausalRuleRow {
                rule_type: s(r, "rule_type"),
                trait_id: s(r, "trait_id"),
                trait_name: s(r, "trait_name"),
                stressor_id: s(r, "stressor_id"),
                stressor_name: s(r, "stressor_name"),
                severity: so(r, "severity").unwrap_or_default(),
                explanation: so(r, "explanation"),
            })
            .collect())
    }

    async fn get_all_product_families_with_traits(
        &self,
    ) -> GraphResult<Vec<ProductFamilyRow>> {
        let rows = self
            .rows(|| {
                query(
                    "MATCH (pf:ProductFamily)
                     OPTIONAL MATCH (pf)-[:HAS_TRAIT]->(dt:PhysicalTrait)
                     OPTIONAL MATCH (pf)-[:AVAILABLE_IN_MATERIAL]->(:Material)-[:PROVIDES_TRAIT]->(mt:PhysicalTrait)
                     WITH pf,
                          [x IN collect(DISTINCT dt.id) WHERE x IS NOT NULL] AS direct_trait_ids,
                          [x IN collect(DISTINCT mt.id) WHERE x IS NOT NULL] AS material_trait_ids
                     RETURN pf.id AS product_id, pf.name AS product_name,
                            pf.selection_priority AS selection_priority,
                            direct_trait_ids, material_trait_ids,
                            direct_trait_ids + [x IN material_trait_ids WHERE NOT x IN direct_trait_ids] AS all_trait_ids
                     ORDER BY pf.selection_priority ASC",
                )
            })
            .await?;
        Ok(rows
            .iter()
            .map(|r| ProductFamilyRow {
                product_id: s(r, "product_id"),
                product_name: s(r, "product_name"),
                selection_priority: io(r, "selection_priority").unwrap_or(100),
                direct_trait_ids: vs(r, "direct_trait_ids"),
                material_trait_ids: vs(r, "material_trait_ids"),
                all_trait_ids: vs(r, "all_trait_ids"),
            })
            .collect())
    }

    async fn get_product_traits(&self, family: &str) -> GraphResult<Vec<TraitRow>> {
        let pf_id = family_id(family);
        let rows = self
            .rows(|| {
                query(
                    "MATCH (pf:ProductFamily {id: $pf_id})-[r:HAS_TRAIT]->(t:PhysicalTrait)
                     RETURN t.id AS id, t.name AS name, 'direct' AS source,
                            r.primary AS is_primary
                     UNION
                     MATCH (pf:ProductFamily {id: $pf_id})-[:AVAILABLE_IN_MATERIAL]->(m:Material)-[:PROVIDES_TRAIT]->(t:PhysicalTrait)
                     RETURN DISTINCT t.id AS id, t.name AS name, m.code AS source,
                            false AS is_primary",
                )
                .param("pf_id", pf_id.clone())
            })
            .await?;
        Ok(rows
            .iter()
            .map(|r| TraitRow {
                id: s(r, "id"),
                name: s(r, "name"),
                source: s(r, "source"),
                is_primary: bo(r, "is_primary").unwrap_or(false),
            })
            .collect())
    }

    async fn get_hard_constraints(&self, family: &str) -> GraphResult<Vec<HardConstraintRow>> {
        let pf_id = family_id(family);
        let rows = self
            .rows(|| {
                query(
                    "MATCH (pf:ProductFamily {id: $pf_id})-[:HAS_HARD_CONSTRAINT]->(hc:HardConstraint)
                     RETURN hc.id AS id, hc.property_key AS property_key,
                            hc.operator AS operator, hc.value AS value,
                            hc.error_msg AS error_msg",
                )
                .param("pf_id", pf_id.clone())
            })
            .await?;
        Ok(rows
            .iter()
            .map(|r| HardConstraintRow {
                id: s(r, "id"),
                property_key: s(r, "property_key"),
                operator: so(r, "operator").unwrap_or_else(|| ">=".into()),
                value: fo(r, "value").unwrap_or(0.0),
                error_msg: so(r, "error_msg").unwrap_or_default(),
            })
            .collect())
    }

    async fn get_installation_constraints(
        &self,
        family: &str,
    ) -> GraphResult<Vec<InstallationConstraintRow>> {
        let pf_id = family_id(family);
        let rows = self
            .rows(|| {
                query(
                    "MATCH (pf:ProductFamily {id: $pf_id})-[:HAS_INSTALLATION_CONSTRAINT]->(ic:InstallationConstraint)
                     RETURN ic.id AS id, ic.constraint_type AS constraint_type,
                            ic.severity AS severity, ic.error_msg AS error_msg,
                            ic.operator AS operator, ic.dimension_key AS dimension_key,
                            ic.input_key AS input_key, ic.cross_property AS cross_property,
                            ic.cross_rel_type AS cross_rel_type,
                            ic.cross_node_match_property AS cross_node_match_property,
                            ic.comparison_key AS comparison_key,
                            ic.material_context_key AS material_context_key,
                            ic.context_match_key AS context_match_key,
                            ic.valid_set AS valid_set,
                            pf.service_access_factor AS service_access_factor,
                            pf.service_access_type AS service_access_type,
                            pf.allowed_environments AS allowed_environments,
                            CASE WHEN ic.comparison_key IS NOT NULL
                                 THEN pf[ic.comparison_key] ELSE NULL
                            END AS product_property_value",
                )
                .param("pf_id", pf_id.clone())
            })
            .await?;
        Ok(rows
            .iter()
            .map(|r| InstallationConstraintRow {
                id: s(r, "id"),
                constraint_type: s(r, "constraint_type"),
                severity: so(r, "severity").unwrap_or_default(),
                error_msg: so(r, "error_msg").unwrap_or_default(),
                operator: so(r, "operator"),
                dimension_key: so(r, "dimension_key"),
                input_key: so(r, "input_key"),
                cross_property: so(r, "cross_property"),
                cross_rel_type: so(r, "cross_rel_type"),
                cross_node_match_property: so(r, "cross_node_match_property"),
                comparison_key: so(r, "comparison_key"),
                material_context_key: so(r, "material_context_key"),
                context_match_key: so(r, "context_match_key"),
                valid_set: vs(r, "valid_set"),
                service_access_factor: fo(r, "service_access_factor"),
                service_access_type: so(r, "service_access_type"),
                allowed_environments: vs(r, "allowed_environments"),
                product_property_value: so(r, "product_property_value"),
            })
            .collect())
    }

    async fn get_variable_features(
        &self,
        family: &str,
    ) -> GraphResult<Vec<VariableFeatureRow>> {
        let pf_id = family_id(family);
        let rows = self
            .rows(|| {
                query(
                    "MATCH (pf:ProductFamily {id: $pf_id})-[:HAS_VARIABLE_FEATURE]->(f:VariableFeature)
                     OPTIONAL MATCH (f)-[:HAS_OPTION]->(o:FeatureOption)
                     WITH f, collect({
                         value: o.value, name: o.name, display_label: o.display_label,
                         benefit: o.benefit, is_default: o.is_default,
                         is_recommended: o.is_recommended,
                         min_required_housing_length: o.min_required_housing_length,
                         length_offset_mm: o.length_offset_mm
                     }) AS options
                     RETURN f.id AS feature_id, f.feature_name AS feature_name,
                            f.parameter_name AS parameter_name, f.question AS question,
                            f.why_needed AS why_needed, f.default_value AS default_value,
                            f.auto_resolve AS auto_resolve, options",
                )
                .param("pf_id", pf_id.clone())
            })
            .await?;
        Ok(rows
            .iter()
            .map(|r| VariableFeatureRow {
                feature_id: s(r, "feature_id"),
                feature_name: s(r, "feature_name"),
                parameter_name: so(r, "parameter_name").unwrap_or_default(),
                question: so(r, "question").unwrap_or_default(),
                why_needed: so(r, "why_needed").unwrap_or_default(),
                default_value: so(r, "default_value"),
                auto_resolve: bo(r, "auto_resolve").unwrap_or(false),
                options: r
                    .get::<Option<Vec<FeatureOption>>>("options")
                    .ok()
                    .flatten()
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|o| !o.value.is_empty() || !o.name.is_empty())
                    .collect(),
            })
            .collect())
    }

    async fn get_capacity_rules(&self, family: &str) -> GraphResult<Vec<CapacityRuleRow>> {
        let pf_id = family_id(family);
        let rows = self
            .rows(|| {
                query(
                    "MATCH (pf:ProductFamily {id: $pf_id})-[:HAS_CAPACITY]->(cr:CapacityRule)
                     RETURN cr.id AS id, cr.module_descriptor AS module_descriptor,
                            cr.input_requirement AS input_requirement,
                            cr.output_rating AS output_rating, cr.assumption AS assumption,
                            cr.description AS description,
                            cr.capacity_per_component AS capacity_per_component,
                            cr.component_count_key AS component_count_key",
                )
                .param("pf_id", pf_id.clone())
            })
            .await?;
        Ok(rows
            .iter()
            .map(|r| CapacityRuleRow {
                id: s(r, "id"),
                module_descriptor: so(r, "module_descriptor").unwrap_or_default(),
                input_requirement: so(r, "input_requirement").unwrap_or_default(),
                output_rating: fo(r, "output_rating").unwrap_or(0.0),
                assumption: so(r, "assumption"),
                description: so(r, "description"),
                capacity_per_component: fo(r, "capacity_per_component"),
                component_count_key: so(r, "component_count_key"),
            })
            .collect())
    }

    async fn get_optimization_strategy(&self, family: &str) -> GraphResult<Option<StrategyRow>> {
        let pf_id = family_id(family);
        let rows = self
            .rows(|| {
                query(
                    "MATCH (pf:ProductFamily {id: $pf_id})-[:OPTIMIZATION_STRATEGY]->(st:Strategy)
                     RETURN st.id AS id, st.name AS name, st.sort_property AS sort_property,
                            st.sort_order AS sort_order, st.primary_axis AS primary_axis,
                            st.secondary_axis AS secondary_axis,
                            st.expansion_unit AS expansion_unit,
                            st.description AS description
                     LIMIT 1",
                )
                .param("pf_id", pf_id.clone())
            })
            .await?;
        Ok(rows.first().map(|r| StrategyRow {
            id: s(r, "id"),
            name: s(r, "name"),
            sort_property: so(r, "sort_property"),
            sort_order: so(r, "sort_order"),
            primary_axis: so(r, "primary_axis"),
            secondary_axis: so(r, "secondary_axis"),
            expansion_unit: so(r, "expansion_unit"),
            description: so(r, "description"),
        }))
    }

    async fn get_logic_gates_for_stressors(
        &self,
        stressor_ids: &[String],
    ) -> GraphResult<Vec<LogicGateRow>> {
        if stressor_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = stressor_ids.to_vec();
        let rows = self
            .rows(|| {
                query(
                    "MATCH (g:LogicGate)-[:MONITORS]->(s:EnvironmentalStressor)
                     WHERE s.id IN $stressor_ids
                     OPTIONAL MATCH (g)-[:REQUIRES_DATA]->(p:Parameter)
                     WITH g, s, collect({
                         param_id: p.id, name: p.name, property_key: p.property_key,
                         priority: p.priority, question: p.question, unit: p.unit
                     }) AS params
                     RETURN g.id AS gate_id, g.name AS gate_name,
                            g.condition_logic AS condition_logic,
                            g.physics_explanation AS physics_explanation,
                            s.id AS stressor_id, s.name AS stressor_name,
                            NULL AS context_id, params
                     ORDER BY g.id",
                )
                .param("stressor_ids", ids.clone())
            })
            .await?;
        Ok(rows.iter().map(Self::gate_row).collect())
    }

    async fn get_gates_triggered_by_context(
        &self,
        context_ids: &[String],
    ) -> GraphResult<Vec<LogicGateRow>> {
        if context_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = context_ids.to_vec();
        let rows = self
            .rows(|| {
                query(
                    "MATCH (ctx)-[:TRIGGERS_GATE]->(g:LogicGate)-[:MONITORS]->(s:EnvironmentalStressor)
                     WHERE ctx.id IN $context_ids
                     OPTIONAL MATCH (g)-[:REQUIRES_DATA]->(p:Parameter)
                     WITH ctx, g, s, collect({
                         param_id: p.id, name: p.name, property_key: p.property_key,
                         priority: p.priority, question: p.question, unit: p.unit
                     }) AS params
                     RETURN g.id AS gate_id, g.name AS gate_name,
                            g.condition_logic AS condition_logic,
                            g.physics_explanation AS physics_explanation,
                            s.id AS stressor_id, s.name AS stressor_name,
                            ctx.id AS context_id, params
                     ORDER BY g.id",
                )
                .param("context_ids", ids.clone())
            })
            .await?;
        Ok(rows.iter().map(Self::gate_row).collect())
    }

    async fn get_dependency_rules_for_stressors(
        &self,
        stressor_ids: &[String],
    ) -> GraphResult<Vec<DependencyRuleRow>> {
        if stressor_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = stressor_ids.to_vec();
        let rows = self
            .rows(|| {
                query(
                    "MATCH (dr:DependencyRule)-[:TRIGGERED_BY_STRESSOR]->(s:EnvironmentalStressor)
                     WHERE s.id IN $stressor_ids
                     MATCH (dr)-[:UPSTREAM_REQUIRES_TRAIT]->(ut:PhysicalTrait)
                     MATCH (dr)-[:DOWNSTREAM_PROVIDES_TRAIT]->(dt:PhysicalTrait)
                     RETURN dr.id AS id, dr.dependency_type AS dependency_type,
                            dr.description AS description,
                            ut.id AS upstream_trait_id, ut.name AS upstream_trait_name,
                            dt.id AS downstream_trait_id, dt.name AS downstream_trait_name,
                            s.id AS stressor_id, s.name AS stressor_name,
                            dr.protector_family_id AS protector_family_id,
                            dr.protector_family_name AS protector_family_name",
                )
                .param("stressor_ids", ids.clone())
            })
            .await?;
        Ok(rows
            .iter()
            .map(|r| DependencyRuleRow {
                id: s(r, "id"),
                dependency_type: s(r, "dependency_type"),
                description: so(r, "description").unwrap_or_default(),
                upstream_trait_id: s(r, "upstream_trait_id"),
                upstream_trait_name: s(r, "upstream_trait_name"),
                downstream_trait_id: s(r, "downstream_trait_id"),
                downstream_trait_name: s(r, "downstream_trait_name"),
                stressor_id: s(r, "stressor_id"),
                stressor_name: s(r, "stressor_name"),
                protector_family_id: so(r, "protector_family_id"),
                protector_family_name: so(r, "protector_family_name"),
            })
            .collect())
    }

    async fn get_required_parameters(&self, family: &str) -> GraphResult<Vec<ParameterRow>> {
        let pf_id = family_id(family);
        let rows = self
            .rows(|| {
                query(
                    "MATCH (pf:ProductFamily {id: $pf_id})-[:REQUIRES_PARAMETER]->(p:Parameter)
                     RETURN p.id AS param_id, p.name AS name,
                            p.property_key AS property_key, p.priority AS priority,
                            p.question AS question, p.unit AS unit,
                            NULL AS rule_name
                     ORDER BY p.priority ASC",
                )
                .param("pf_id", pf_id.clone())
            })
            .await?;
        Ok(rows
            .iter()
            .map(|r| ParameterRow {
                param_id: s(r, "param_id"),
                name: s(r, "name"),
                property_key: so(r, "property_key").unwrap_or_default(),
                priority: io(r, "priority").unwrap_or(1),
                question: so(r, "question").unwrap_or_default(),
                unit: so(r, "unit"),
                rule_name: None,
            })
            .collect())
    }

    async fn get_contextual_clarifications(
        &self,
        application_id: &str,
        family: Option<&str>,
    ) -> GraphResult<Vec<ParameterRow>> {
        let pf_id = family.map(family_id).unwrap_or_default();
        let rows = self
            .rows(|| {
                query(
                    "MATCH (cr:ClarificationRule)-[:TRIGGERED_BY_CONTEXT]->(ctx {id: $app_id})
                     OPTIONAL MATCH (cr)-[:APPLIES_TO_PRODUCT]->(pf:ProductFamily)
                     WITH cr, collect(pf.id) AS scoped_families
                     WHERE size(scoped_families) = 0 OR $pf_id IN scoped_families
                     MATCH (cr)-[:DEMANDS_PARAMETER]->(p:Parameter)
                     RETURN p.id AS param_id, p.name AS name,
                            p.property_key AS property_key, p.priority AS priority,
                            p.question AS question, p.unit AS unit,
                            cr.name AS rule_name
                     ORDER BY p.priority ASC",
                )
                .param("app_id", application_id)
                .param("pf_id", pf_id.clone())
            })
            .await?;
        Ok(rows
            .iter()
            .map(|r| ParameterRow {
                param_id: s(r, "param_id"),
                name: s(r, "name"),
                property_key: so(r, "property_key").unwrap_or_default(),
                priority: io(r, "priority").unwrap_or(5),
                question: so(r, "question").unwrap_or_default(),
                unit: so(r, "unit"),
                rule_name: so(r, "rule_name"),
            })
            .collect())
    }

    async fn get_available_dimension_modules(
        &self,
        family: &str,
    ) -> GraphResult<Vec<DimensionModuleRow>> {
        let pf_id = family_id(family);
        let rows = self
            .rows(|| {
                query(
                    "MATCH (pf:ProductFamily {id: $pf_id})-[:HAS_VARIANT]->(pv:ProductVariant)
                     WHERE pv.width_mm IS NOT NULL AND pv.height_mm IS NOT NULL
                     RETURN pv.id AS id, pv.width_mm AS width_mm, pv.height_mm AS height_mm,
                            pv.reference_airflow_m3h AS reference_airflow_m3h,
                            pv.label AS label
                     ORDER BY pv.reference_airflow_m3h DESC",
                )
                .param("pf_id", pf_id.clone())
            })
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| {
                Some(DimensionModuleRow {
                    id: s(r, "id"),
                    width_mm: io(r, "width_mm")?,
                    height_mm: io(r, "height_mm")?,
                    reference_airflow_m3h: io(r, "reference_airflow_m3h"),
                    label: so(r, "label").unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn get_reference_airflow_for_dimensions(
        &self,
        width_mm: i64,
        height_mm: i64,
        family: Option<&str>,
    ) -> GraphResult<Option<i64>> {
        let pf_id = family.map(family_id).unwrap_or_default();
        let rows = self
            .rows(|| {
                query(
                    "MATCH (pf:ProductFamily)-[:HAS_VARIANT]->(pv:ProductVariant)
                     WHERE pv.width_mm = $width AND pv.height_mm = $height
                       AND ($pf_id = '' OR pf.id = $pf_id)
                     RETURN pv.reference_airflow_m3h AS airflow
                     LIMIT 1",
                )
                .param("width", width_mm)
                .param("height", height_mm)
                .param("pf_id", pf_id.clone())
            })
            .await?;
        Ok(rows.first().and_then(|r| io(r, "airflow")))
    }

    async fn get_variant_weight(
        &self,
        variant_name: &str,
        housing_length: Option<i64>,
    ) -> GraphResult<Option<f64>> {
        let length = housing_length.unwrap_or(0);
        let rows = self
            .rows(|| {
                query(
                    "MATCH (pv:ProductVariant {name: $name})
                     WHERE $length = 0 OR pv.housing_length_mm IS NULL
                        OR pv.housing_length_mm = $length
                     RETURN pv.weight_kg AS weight_kg
                     LIMIT 1",
                )
                .param("name", variant_name)
                .param("length", length)
            })
            .await?;
        Ok(rows.first().and_then(|r| fo(r, "weight_kg")))
    }

    async fn get_dimension_module_weight(
        &self,
        width_mm: i64,
        height_mm: i64,
    ) -> GraphResult<Option<ModuleWeightRow>> {
        let rows = self
            .rows(|| {
                query(
                    "MATCH (dm:DimensionModule)
                     WHERE dm.width_mm = $width AND dm.height_mm = $height
                       AND dm.unit_weight_kg IS NOT NULL
                     RETURN dm.unit_weight_kg AS unit_weight_kg,
                            dm.weight_per_mm_length AS weight_per_mm_length,
                            dm.reference_length_mm AS reference_length_mm
                     LIMIT 1",
                )
                .param("width", width_mm)
                .param("height", height_mm)
            })
            .await?;
        Ok(rows.first().map(|r| ModuleWeightRow {
            unit_weight_kg: fo(r, "unit_weight_kg").unwrap_or(0.0),
            weight_per_mm_length: fo(r, "weight_per_mm_length"),
            reference_length_mm: io(r, "reference_length_mm"),
        }))
    }

    async fn get_product_family_code_format(
        &self,
        family: &str,
    ) -> GraphResult<Option<CodeFormatRow>> {
        let pf_id = family_id(family);
        let rows = self
            .rows(|| {
                query(
                    "MATCH (pf:ProductFamily {id: $pf_id})
                     RETURN pf.code_format AS fmt,
                            pf.default_frame_depth AS default_frame_depth",
                )
                .param("pf_id", pf_id.clone())
            })
            .await?;
        Ok(rows.first().map(|r| CodeFormatRow {
            fmt: so(r, "fmt"),
            default_frame_depth: io(r, "default_frame_depth"),
        }))
    }

    async fn get_accessory_compatibility(
        &self,
        accessory_code: &str,
        family: &str,
    ) -> GraphResult<AccessoryCompatRow> {
        let pf_id = family_id(family);
        let rows = self
            .rows(|| {
                query(
                    "OPTIONAL MATCH (acc:Accessory {code: $code})
                     OPTIONAL MATCH (pf:ProductFamily {id: $pf_id})-[allow:HAS_COMPATIBLE_ACCESSORY]->(acc)
                     OPTIONAL MATCH (pf2:ProductFamily {id: $pf_id})-[deny:INCOMPATIBLE_WITH]->(acc)
                     OPTIONAL MATCH (pf3:ProductFamily {id: $pf_id})-[:HAS_COMPATIBLE_ACCESSORY]->(other:Accessory)
                     RETURN acc.name AS accessory_name,
                            acc IS NOT NULL AS known,
                            allow IS NOT NULL AS allowed,
                            deny IS NOT NULL AS denied,
                            deny.reason AS deny_reason,
                            collect(DISTINCT other.code) AS compatible_alternatives",
                )
                .param("code", accessory_code)
                .param("pf_id", pf_id.clone())
            })
            .await?;
        let Some(row) = rows.first() else {
            return Ok(AccessoryCompatRow {
                accessory_code: accessory_code.to_string(),
                accessory_name: accessory_code.to_string(),
                product_family_id: pf_id,
                status: "UNKNOWN".into(),
                reason: Some("Accessory not present in engineering data".into()),
                compatible_alternatives: Vec::new(),
            });
        };
        let known = bo(row, "known").unwrap_or(false);
        let allowed = bo(row, "allowed").unwrap_or(false);
        let denied = bo(row, "denied").unwrap_or(false);
        let name = so(row, "accessory_name").unwrap_or_else(|| accessory_code.to_string());
        let alternatives = vs(row, "compatible_alternatives");
        let (status, reason) = if !known {
            ("UNKNOWN", Some("Accessory not present in engineering data".into()))
        } else if allowed {
            ("ALLOWED", None)
        } else if denied {
            ("BLOCKED", so(row, "deny_reason"))
        } else {
            (
                "NOT_ALLOWED",
                Some("No compatibility relationship in engineering data".into()),
            )
        };
        Ok(AccessoryCompatRow {
            accessory_code: accessory_code.to_string(),
            accessory_name: name,
            product_family_id: pf_id,
            status: status.into(),
            reason,
            compatible_alternatives: if status == "ALLOWED" { Vec::new() } else { alternatives },
        })
    }

    async fn get_all_accessory_codes(&self) -> GraphResult<Vec<AccessoryRow>> {
        let rows = self
            .rows(|| {
                query(
                    "MATCH (a:Accessory)
                     RETURN a.id AS id, replace(a.id, 'ACC_', '') AS code, a.name AS name
                     ORDER BY a.id",
                )
            })
            .await?;
        Ok(rows
            .iter()
            .map(|r| AccessoryRow {
                id: s(r, "id"),
                code: s(r, "code"),
                name: so(r, "name").unwrap_or_default(),
            })
            .collect())
    }

    async fn get_material_property(
        &self,
        family: &str,
        material_code: &str,
        property: &str,
    ) -> GraphResult<Option<f64>> {
        let pf_id = family_id(family);
        // Property name comes from graph IC metadata, not user input.
        let cypher = format!(
            "MATCH (pf:ProductFamily {{id: $pf_id}})-[:AVAILABLE_IN_MATERIAL]->(m:Material {{code: $code}})
             RETURN m.{property} AS value LIMIT 1"
        );
        let rows = self
            .rows(|| {
                query(&cypher)
                    .param("pf_id", pf_id.clone())
                    .param("code", material_code)
            })
            .await?;
        Ok(rows.first().and_then(|r| fo(r, "value")))
    }

    async fn get_related_node_property(
        &self,
        family: &str,
        rel_type: &str,
        match_prop: &str,
        match_val: &Value,
        target_prop: &str,
    ) -> GraphResult<Option<Value>> {
        let pf_id = family_id(family);
        let cypher = format!(
            "MATCH (pf:ProductFamily {{id: $pf_id}})-[:{rel_type}]->(node)
             WHERE node.{match_prop} = $match_val
             RETURN node.{target_prop} AS value LIMIT 1"
        );
        let rows = match match_val {
            Value::Number(n) if n.is_i64() => {
                let v = n.as_i64().unwrap_or_default();
                self.rows(|| query(&cypher).param("pf_id", pf_id.clone()).param("match_val", v))
                    .await?
            }
            Value::Number(n) => {
                let v = n.as_f64().unwrap_or_default();
                self.rows(|| query(&cypher).param("pf_id", pf_id.clone()).param("match_val", v))
                    .await?
            }
            other => {
                let v = other.as_str().unwrap_or_default().to_string();
                self.rows(|| {
                    query(&cypher)
                        .param("pf_id", pf_id.clone())
                        .param("match_val", v.clone())
                })
                .await?
            }
        };
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        if let Some(v) = io(row, "value") {
            return Ok(Some(Value::from(v)));
        }
        if let Some(v) = fo(row, "value") {
            return Ok(Some(Value::from(v)));
        }
        Ok(so(row, "value").map(Value::String))
    }

    async fn find_compatible_variants(
        &self,
        family: &str,
        rel_type: &str,
        match_prop: &str,
        threshold_prop: &str,
        min_threshold: f64,
    ) -> GraphResult<Vec<VariantThresholdRow>> {
        let pf_id = family_id(family);
        let cypher = format!(
            "MATCH (pf:ProductFamily {{id: $pf_id}})-[:{rel_type}]->(node)
             WHERE node.{threshold_prop} >= $min_threshold
             RETURN node.{match_prop} AS variant_value, node.{threshold_prop} AS threshold
             ORDER BY node.{threshold_prop} ASC"
        );
        let rows = self
            .rows(|| {
                query(&cypher)
                    .param("pf_id", pf_id.clone())
                    .param("min_threshold", min_threshold)
            })
            .await?;
        Ok(rows
            .iter()
            .map(|r| VariantThresholdRow {
                variant_value: io(r, "variant_value")
                    .map(Value::from)
                    .or_else(|| so(r, "variant_value").map(Value::String))
                    .unwrap_or(Value::Null),
                threshold: fo(r, "threshold").unwrap_or(0.0),
            })
            .collect())
    }

    async fn find_alternatives_for_space_constraint(
        &self,
        blocked_family: &str,
        dimension_key: &str,
        available_space: f64,
        dim_value: f64,
        required_trait_ids: &[String],
    ) -> GraphResult<Vec<ProductAltRow>> {
        let blocked = family_id(blocked_family);
        let trait_ids = required_trait_ids.to_vec();
        let trait_count = trait_ids.len() as i64;
        // dimension_key comes from graph IC metadata, not user input.
        let cypher = format!(
            "MATCH (pf:ProductFamily)
             WHERE pf.id <> $blocked AND pf.service_access_factor IS NOT NULL
             WITH pf, $dim_value * (1.0 + pf.service_access_factor) AS required_space
             WHERE required_space <= $available_space
             MATCH (pf)-[:HAS_VARIANT]->(pv:ProductVariant)
             WHERE pv.{dimension_key}_mm = toInteger($dim_value)
             WITH DISTINCT pf, required_space
             WHERE $trait_count = 0 OR size([tid IN $trait_ids WHERE
                 EXISTS {{ MATCH (pf)-[:HAS_TRAIT]->(:PhysicalTrait {{id: tid}}) }}
                 OR EXISTS {{ MATCH (pf)-[:AVAILABLE_IN_MATERIAL]->(:Material)-[:PROVIDES_TRAIT]->(:PhysicalTrait {{id: tid}}) }}
             ]) = $trait_count
             RETURN pf.id AS product_id, pf.name AS product_name,
                    pf.selection_priority AS selection_priority,
                    pf.service_access_factor AS service_access_factor,
                    pf.service_access_type AS service_access_type,
                    required_space AS required_space_mm
             ORDER BY pf.selection_priority ASC"
        );
        let rows = self
            .rows(|| {
                query(&cypher)
                    .param("blocked", blocked.clone())
                    .param("dim_value", dim_value)
                    .param("available_space", available_space)
                    .param("trait_ids", trait_ids.clone())
                    .param("trait_count", trait_count)
            })
            .await?;
        Ok(rows
            .iter()
            .map(|r| {
                let mut details = BTreeMap::new();
                if let Some(v) = fo(r, "service_access_factor") {
                    details.insert("service_access_factor".into(), Value::from(v));
                }
                if let Some(v) = so(r, "service_access_type") {
                    details.insert("service_access_type".into(), Value::String(v));
                }
                if let Some(v) = fo(r, "required_space_mm") {
                    details.insert("required_space_mm".into(), Value::from(v));
                }
                ProductAltRow {
                    product_id: s(r, "product_id"),
                    product_name: s(r, "product_name"),
                    selection_priority: io(r, "selection_priority").unwrap_or(100),
                    details,
                }
            })
            .collect())
    }

    async fn find_alternatives_for_environment_constraint(
        &self,
        blocked_family: &str,
        env_chain: &[String],
        required_trait_ids: &[String],
    ) -> GraphResult<Vec<ProductAltRow>> {
        let blocked = family_id(blocked_family);
        let chain = env_chain.to_vec();
        let trait_ids = required_trait_ids.to_vec();
        let trait_count = trait_ids.len() as i64;
        let rows = self
            .rows(|| {
                query(
                    "MATCH (pf:ProductFamily)
                     WHERE pf.id <> $blocked
                       AND pf.allowed_environments IS NOT NULL
                       AND ANY(env IN $env_chain WHERE env IN pf.allowed_environments)
                     WITH pf
                     WHERE $trait_count = 0 OR size([tid IN $trait_ids WHERE
                         EXISTS { MATCH (pf)-[:HAS_TRAIT]->(:PhysicalTrait {id: tid}) }
                         OR EXISTS { MATCH (pf)-[:AVAILABLE_IN_MATERIAL]->(:Material)-[:PROVIDES_TRAIT]->(:PhysicalTrait {id: tid}) }
                     ]) = $trait_count
                     RETURN pf.id AS product_id, pf.name AS product_name,
                            pf.selection_priority AS selection_priority,
                            pf.allowed_environments AS allowed_environments
                     ORDER BY pf.selection_priority ASC",
                )
                .param("blocked", blocked.clone())
                .param("env_chain", chain.clone())
                .param("trait_ids", trait_ids.clone())
                .param("trait_count", trait_count)
            })
            .await?;
        Ok(rows
            .iter()
            .map(|r| {
                let mut details = BTreeMap::new();
                details.insert(
                    "allowed_environments".into(),
                    Value::Array(
                        vs(r, "allowed_environments")
                            .into_iter()
                            .map(Value::String)
                            .collect(),
                    ),
                );
                ProductAltRow {
                    product_id: s(r, "product_id"),
                    product_name: s(r, "product_name"),
                    selection_priority: io(r, "selection_priority").unwrap_or(100),
                    details,
                }
            })
            .collect())
    }

    async fn find_material_alternatives_for_threshold(
        &self,
        family: &str,
        cross_property: &str,
        required_value: f64,
    ) -> GraphResult<Vec<MaterialAltRow>> {
        let pf_id = family_id(family);
        let cypher = format!(
            "MATCH (pf:ProductFamily {{id: $pf_id}})-[:AVAILABLE_IN_MATERIAL]->(m:Material)
             WHERE m.{cross_property} IS NOT NULL AND m.{cross_property} >= $required
             RETURN m.code AS material_code, m.name AS material_name,
                    m.{cross_property} AS threshold_value
             ORDER BY m.{cross_property} DESC"
        );
        let rows = self
            .rows(|| {
                query(&cypher)
                    .param("pf_id", pf_id.clone())
                    .param("required", required_value)
            })
            .await?;
        Ok(rows
            .iter()
            .map(|r| MaterialAltRow {
                material_code: s(r, "material_code"),
                material_name: so(r, "material_name").unwrap_or_default(),
                threshold_value: fo(r, "threshold_value").unwrap_or(0.0),
            })
            .collect())
    }

    async fn find_other_products_for_material_threshold(
        &self,
        blocked_family: &str,
        cross_property: &str,
        required_value: f64,
        required_trait_ids: &[String],
    ) -> GraphResult<Vec<ProductAltRow>> {
        let blocked = family_id(blocked_family);
        let trait_ids = required_trait_ids.to_vec();
        let trait_count = trait_ids.len() as i64;
        let cypher = format!(
            "MATCH (pf:ProductFamily)-[:AVAILABLE_IN_MATERIAL]->(m:Material)
             WHERE pf.id <> $blocked AND m.{cross_property} IS NOT NULL
               AND m.{cross_property} >= $required
             WITH pf, collect({{code: m.code, name: m.name, threshold: m.{cross_property}}}) AS mats
             WHERE size(mats) > 0
               AND ($trait_count = 0 OR size([tid IN $trait_ids WHERE
                   EXISTS {{ MATCH (pf)-[:HAS_TRAIT]->(:PhysicalTrait {{id: tid}}) }}
                   OR EXISTS {{ MATCH (pf)-[:AVAILABLE_IN_MATERIAL]->(:Material)-[:PROVIDES_TRAIT]->(:PhysicalTrait {{id: tid}}) }}
               ]) = $trait_count)
             RETURN pf.id AS product_id, pf.name AS product_name,
                    pf.selection_priority AS selection_priority, mats
             ORDER BY pf.selection_priority ASC"
        );
        let rows = self
            .rows(|| {
                query(&cypher)
                    .param("blocked", blocked.clone())
                    .param("required", required_value)
                    .param("trait_ids", trait_ids.clone())
                    .param("trait_count", trait_count)
            })
            .await?;
        Ok(rows
            .iter()
            .map(|r| {
                let mats = r
                    .get::<Option<Vec<serde_json::Value>>>("mats")
                    .ok()
                    .flatten()
                    .unwrap_or_default();
                let mut details = BTreeMap::new();
                details.insert("qualifying_materials".into(), Value::Array(mats));
                ProductAltRow {
                    product_id: s(r, "product_id"),
                    product_name: s(r, "product_name"),
                    selection_priority: io(r, "selection_priority").unwrap_or(100),
                    details,
                }
            })
            .collect())
    }

    async fn find_products_with_higher_capacity(
        &self,
        blocked_family: &str,
        module_descriptor: &str,
        min_output_rating: f64,
        required_trait_ids: &[String],
    ) -> GraphResult<Vec<CapacityAltRow>> {
        let blocked = family_id(blocked_family);
        let trait_ids = required_trait_ids.to_vec();
        let trait_count = trait_ids.len() as i64;
        let rows = self
            .rows(|| {
                query(
                    "MATCH (pf:ProductFamily)-[:HAS_CAPACITY]->(cr:CapacityRule)
                     WHERE pf.id <> $blocked
                       AND cr.module_descriptor = $descriptor
                       AND cr.output_rating > $min_rating
                     WITH pf, cr
                     WHERE $trait_count = 0 OR size([tid IN $trait_ids WHERE
                         EXISTS { MATCH (pf)-[:HAS_TRAIT]->(:PhysicalTrait {id: tid}) }
                         OR EXISTS { MATCH (pf)-[:AVAILABLE_IN_MATERIAL]->(:Material)-[:PROVIDES_TRAIT]->(:PhysicalTrait {id: tid}) }
                     ]) = $trait_count
                     RETURN pf.id AS product_id, pf.name AS product_name,
                            pf.selection_priority AS selection_priority,
                            cr.output_rating AS output_rating,
                            cr.description AS description
                     ORDER BY pf.selection_priority ASC",
                )
                .param("blocked", blocked.clone())
                .param("descriptor", module_descriptor)
                .param("min_rating", min_output_rating)
                .param("trait_ids", trait_ids.clone())
                .param("trait_count", trait_count)
            })
            .await?;
        Ok(rows
            .iter()
            .map(|r| CapacityAltRow {
                product_id: s(r, "product_id"),
                product_name: s(r, "product_name"),
                selection_priority: io(r, "selection_priority").unwrap_or(100),
                output_rating: fo(r, "output_rating").unwrap_or(0.0),
                description: so(r, "description"),
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// SessionGraph
// ---------------------------------------------------------------------------

fn project_id(session_id: &str) -> String {
    format!("APRJ_{session_id}")
}

#[async_trait]
impl SessionGraph for Neo4jGraph {
    async fn ensure_session(&self, session_id: &str, user_id: &str) -> GraphResult<()> {
        self.run(|| {
            query(
                "MERGE (s:Session {id: $session_id})
                 SET s.user_id = $user_id,
                     s.last_active = timestamp(),
                     s.created_at = COALESCE(s.created_at, timestamp())
                 MERGE (s)-[:WORKING_ON]->(p:ActiveProject {id: $project_id})
                 SET p.session_id = $session_id",
            )
            .param("session_id", session_id)
            .param("user_id", user_id)
            .param("project_id", project_id(session_id))
        })
        .await
    }

    async fn set_project(
        &self,
        session_id: &str,
        project_name: &str,
        customer: Option<&str>,
    ) -> GraphResult<()> {
        self.run(|| {
            query(
                "MERGE (s:Session {id: $session_id})
                 SET s.last_active = timestamp()
                 MERGE (s)-[:WORKING_ON]->(p:ActiveProject {id: $project_id})
                 SET p.name = $name, p.session_id = $session_id",
            )
            .param("session_id", session_id)
            .param("project_id", project_id(session_id))
            .param("name", project_name)
        })
        .await?;
        if let Some(customer) = customer {
            self.run(|| {
                query(
                    "MATCH (p:ActiveProject {id: $project_id})
                     SET p.customer = $customer",
                )
                .param("project_id", project_id(session_id))
                .param("customer", customer)
            })
            .await?;
        }
        Ok(())
    }

    async fn lock_material(&self, session_id: &str, material_code: &str) -> GraphResult<()> {
        let code = material_code.to_uppercase();
        self.run(|| {
            query(
                "MERGE (s:Session {id: $session_id})
                 SET s.last_active = timestamp()
                 MERGE (s)-[:WORKING_ON]->(p:ActiveProject {id: $project_id})
                 SET p.locked_material = $code, p.session_id = $session_id",
            )
            .param("session_id", session_id)
            .param("project_id", project_id(session_id))
            .param("code", code.clone())
        })
        .await?;
        // Conditional relink, split into delete + link (no FOREACH tricks):
        // the link statement matches zero rows when the material is unknown.
        self.run(|| {
            query(
                "MATCH (p:ActiveProject {id: $project_id})-[old:USES_MATERIAL]->()
                 DELETE old",
            )
            .param("project_id", project_id(session_id))
        })
        .await?;
        self.run(|| {
            query(
                "MATCH (p:ActiveProject {id: $project_id}), (m:Material {code: $code})
                 MERGE (p)-[:USES_MATERIAL]->(m)",
            )
            .param("project_id", project_id(session_id))
            .param("code", code.clone())
        })
        .await
    }

    async fn set_detected_family(&self, session_id: &str, family: &str) -> GraphResult<()> {
        let family = family.to_uppercase();
        let fam_id = family_id(&family);
        self.run(|| {
            query(
                "MERGE (s:Session {id: $session_id})
                 SET s.last_active = timestamp()
                 MERGE (s)-[:WORKING_ON]->(p:ActiveProject {id: $project_id})
                 SET p.detected_family = $family, p.session_id = $session_id",
            )
            .param("session_id", session_id)
            .param("project_id", project_id(session_id))
            .param("family", family.clone())
        })
        .await?;
        self.run(|| {
            query(
                "MATCH (p:ActiveProject {id: $project_id})-[old:TARGETS_FAMILY]->()
                 DELETE old",
            )
            .param("project_id", project_id(session_id))
        })
        .await?;
        self.run(|| {
            query(
                "MATCH (p:ActiveProject {id: $project_id}), (pf:ProductFamily {id: $fam_id})
                 MERGE (p)-[:TARGETS_FAMILY]->(pf)",
            )
            .param("project_id", project_id(session_id))
            .param("fam_id", fam_id.clone())
        })
        .await
    }

    async fn set_pending_clarification(
        &self,
        session_id: &str,
        param_name: Option<&str>,
    ) -> GraphResult<()> {
        // Null is written as a literal: the clearer is explicit, never an
        // accidental unset.
        match param_name {
            Some(value) => {
                self.run(|| {
                    query(
                        "MERGE (s:Session {id: $session_id})
                         SET s.last_active = timestamp()
                         MERGE (s)-[:WORKING_ON]->(p:ActiveProject {id: $project_id})
                         SET p.pending_clarification = $value, p.session_id = $session_id",
                    )
                    .param("session_id", session_id)
                    .param("project_id", project_id(session_id))
                    .param("value", value)
                })
                .await
            }
            None => {
                self.run(|| {
                    query(
                        "MERGE (s:Session {id: $session_id})
                         SET s.last_active = timestamp()
                         MERGE (s)-[:WORKING_ON]->(p:ActiveProject {id: $project_id})
                         SET p.pending_clarification = NULL, p.session_id = $session_id",
                    )
                    .param("session_id", session_id)
                    .param("project_id", project_id(session_id))
                })
                .await
            }
        }
    }

    async fn set_accessories(&self, session_id: &str, accessories: &[String]) -> GraphResult<()> {
        let accessories = accessories.to_vec();
        self.run(|| {
            query(
                "MERGE (s:Session {id: $session_id})
                 SET s.last_active = timestamp()
                 MERGE (s)-[:WORKING_ON]->(p:ActiveProject {id: $project_id})
                 SET p.accessories = $accessories, p.session_id = $session_id",
            )
            .param("session_id", session_id)
            .param("project_id", project_id(session_id))
            .param("accessories", accessories.clone())
        })
        .await
    }

    async fn set_assembly_group(&self, session_id: &str, assembly_json: &str) -> GraphResult<()> {
        self.run(|| {
            query(
                "MERGE (s:Session {id: $session_id})
                 SET s.last_active = timestamp()
                 MERGE (s)-[:WORKING_ON]->(p:ActiveProject {id: $project_id})
                 SET p.assembly_group = $json, p.session_id = $session_id",
            )
            .param("session_id", session_id)
            .param("project_id", project_id(session_id))
            .param("json", assembly_json)
        })
        .await
    }

    async fn set_resolved_params(&self, session_id: &str, params_json: &str) -> GraphResult<()> {
        self.run(|| {
            query(
                "MERGE (s:Session {id: $session_id})
                 SET s.last_active = timestamp()
                 MERGE (s)-[:WORKING_ON]->(p:ActiveProject {id: $project_id})
                 SET p.resolved_params = $json, p.session_id = $session_id",
            )
            .param("session_id", session_id)
            .param("project_id", project_id(session_id))
            .param("json", params_json)
        })
        .await
    }

    async fn set_vetoed_families(&self, session_id: &str, vetoed_json: &str) -> GraphResult<()> {
        self.run(|| {
            query(
                "MERGE (s:Session {id: $session_id})
                 SET s.last_active = timestamp()
                 MERGE (s)-[:WORKING_ON]->(p:ActiveProject {id: $project_id})
                 SET p.vetoed_families = $json, p.session_id = $session_id",
            )
            .param("session_id", session_id)
            .param("project_id", project_id(session_id))
            .param("json", vetoed_json)
        })
        .await
    }

    async fn upsert_tag(
        &self,
        session_id: &str,
        tag_id: &str,
        patch: &TagPatch,
        sync_properties: &[String],
    ) -> GraphResult<TagRow> {
        let tag_node_id = format!("TAG_{session_id}_{tag_id}");

        // Dynamic SET clause: only fields present in the patch are written,
        // so a None never blanks a stored value.
        let mut set_parts = vec![
            "t.tag_id = $tag_id".to_string(),
            "t.session_id = $session_id".to_string(),
        ];

        macro_rules! opt_set {
            ($field:ident) => {
                if patch.$field.is_some() {
                    set_parts.push(format!("t.{} = ${}", stringify!($field), stringify!($field)));
                }
            };
        }
        opt_set!(filter_width);
        opt_set!(filter_height);
        opt_set!(filter_depth);
        opt_set!(housing_width);
        opt_set!(housing_height);
        opt_set!(housing_length);
        opt_set!(airflow_m3h);
        opt_set!(product_family);
        opt_set!(product_code);
        opt_set!(weight_kg);
        opt_set!(quantity);
        opt_set!(modules_needed);
        opt_set!(material_override);
        opt_set!(assembly_group_id);
        opt_set!(source_turn);
        if patch.assembly_role.is_some() {
            set_parts.push("t.assembly_role = $assembly_role".into());
        }

        let cypher = format!(
            "MERGE (s:Session {{id: $session_id}})
             SET s.last_active = timestamp()
             MERGE (s)-[:WORKING_ON]->(p:ActiveProject {{id: $project_id}})
             SET p.session_id = $session_id
             MERGE (p)-[:HAS_UNIT]->(t:TagUnit {{id: $tag_node_id}})
             SET {}
             WITH t
             SET t.is_complete = (
                 t.housing_width IS NOT NULL AND
                 t.housing_height IS NOT NULL AND
                 t.housing_length IS NOT NULL
             )
             RETURN t.tag_id AS tag_id, t.filter_width AS filter_width,
                    t.filter_height AS filter_height, t.filter_depth AS filter_depth,
                    t.housing_width AS housing_width, t.housing_height AS housing_height,
                    t.housing_length AS housing_length, t.airflow_m3h AS airflow_m3h,
                    t.product_family AS product_family, t.product_code AS product_code,
                    t.weight_kg AS weight_kg, t.quantity AS quantity,
                    t.modules_needed AS modules_needed,
                    t.material_override AS material_override,
                    t.assembly_role AS assembly_role,
                    t.assembly_group_id AS assembly_group_id,
                    t.is_complete AS is_complete",
            set_parts.join(", ")
        );

        let build = || {
            let mut q = query(&cypher)
                .param("session_id", session_id)
                .param("project_id", project_id(session_id))
                .param("tag_node_id", tag_node_id.clone())
                .param("tag_id", tag_id);
            macro_rules! bind_i64 {
                ($field:ident) => {
                    if let Some(v) = patch.$field {
                        q = q.param(stringify!($field), v);
                    }
                };
            }
            bind_i64!(filter_width);
            bind_i64!(filter_height);
            bind_i64!(filter_depth);
            bind_i64!(housing_width);
            bind_i64!(housing_height);
            bind_i64!(housing_length);
            bind_i64!(airflow_m3h);
            bind_i64!(quantity);
            bind_i64!(modules_needed);
            bind_i64!(source_turn);
            if let Some(v) = &patch.product_family {
                q = q.param("product_family", v.clone());
            }
            if let Some(v) = &patch.product_code {
                q = q.param("product_code", v.clone());
            }
            if let Some(v) = patch.weight_kg {
                q = q.param("weight_kg", v);
            }
            if let Some(v) = &patch.material_override {
                q = q.param("material_override", v.clone());
            }
            if let Some(v) = &patch.assembly_role {
                q = q.param("assembly_role", v.to_string());
            }
            if let Some(v) = &patch.assembly_group_id {
                q = q.param("assembly_group_id", v.clone());
            }
            q
        };

        let rows = self.rows(build).await?;
        let row = rows
            .first()
            .ok_or_else(|| GraphError::Query("upsert_tag returned no row".into()))?;
        let tag = TagRow {
            tag_id: s(row, "tag_id"),
            filter_width: io(row, "filter_width"),
            filter_height: io(row, "filter_height"),
            filter_depth: io(row, "filter_depth"),
            housing_width: io(row, "housing_width"),
            housing_height: io(row, "housing_height"),
            housing_length: io(row, "housing_length"),
            airflow_m3h: io(row, "airflow_m3h"),
            product_family: so(row, "product_family"),
            product_code: so(row, "product_code"),
            weight_kg: fo(row, "weight_kg"),
            quantity: io(row, "quantity"),
            modules_needed: io(row, "modules_needed"),
            material_override: so(row, "material_override"),
            assembly_role: so(row, "assembly_role"),
            assembly_group_id: so(row, "assembly_group_id"),
            is_complete: bo(row, "is_complete").unwrap_or(false),
        };

        // Sibling sync in a follow-up statement: COALESCE keeps a sibling's
        // own value, so only missing shared properties are inherited.
        if patch.assembly_group_id.is_some() && !sync_properties.is_empty() {
            let sync_sets: Vec<String> = sync_properties
                .iter()
                .map(|p| format!("sibling.{p} = COALESCE(sibling.{p}, t.{p})"))
                .collect();
            let sync_cypher = format!(
                "MATCH (t:TagUnit {{id: $tag_node_id}})
                 MATCH (:ActiveProject {{id: $project_id}})-[:HAS_UNIT]->(sibling:TagUnit)
                 WHERE sibling.assembly_group_id = t.assembly_group_id
                   AND sibling.id <> t.id
                 SET {},
                     sibling.is_complete = (
                         sibling.housing_width IS NOT NULL AND
                         sibling.housing_height IS NOT NULL AND
                         sibling.housing_length IS NOT NULL
                     )",
                sync_sets.join(", ")
            );
            self.run(|| {
                query(&sync_cypher)
                    .param("tag_node_id", tag_node_id.clone())
                    .param("project_id", project_id(session_id))
            })
            .await?;
        }

        // Link to the catalog dimension module: delete + conditional link.
        if let (Some(w), Some(h)) = (tag.housing_width, tag.housing_height) {
            let dim_id = format!("DIM_{w}x{h}");
            self.run(|| {
                query(
                    "MATCH (t:TagUnit {id: $tag_node_id})-[old:SIZED_AS]->()
                     DELETE old",
                )
                .param("tag_node_id", tag_node_id.clone())
            })
            .await?;
            self.run(|| {
                query(
                    "MATCH (t:TagUnit {id: $tag_node_id}), (d:DimensionModule {id: $dim_id})
                     MERGE (t)-[:SIZED_AS]->(d)",
                )
                .param("tag_node_id", tag_node_id.clone())
                .param("dim_id", dim_id.clone())
            })
            .await?;
        }

        Ok(tag)
    }

    async fn get_project_state(&self, session_id: &str) -> GraphResult<ProjectState> {
        let rows = self
            .rows(|| {
                query(
                    "MATCH (s:Session {id: $session_id})
                     OPTIONAL MATCH (s)-[:WORKING_ON]->(p:ActiveProject)
                     RETURN p.name AS name, p.customer AS customer,
                            p.locked_material AS locked_material,
                            p.detected_family AS detected_family,
                            p.pending_clarification AS pending_clarification,
                            p.accessories AS accessories,
                            p.resolved_params AS resolved_params,
                            p.assembly_group AS assembly_group,
                            p.vetoed_families AS vetoed_families",
                )
                .param("session_id", session_id)
            })
            .await?;
        let project = rows.first().map(|r| ProjectRow {
            name: so(r, "name"),
            customer: so(r, "customer"),
            locked_material: so(r, "locked_material"),
            detected_family: so(r, "detected_family"),
            pending_clarification: so(r, "pending_clarification"),
            accessories: vs(r, "accessories"),
            resolved_params: so(r, "resolved_params"),
            assembly_group: so(r, "assembly_group"),
            vetoed_families: so(r, "vetoed_families"),
        });

        let tag_rows = self
            .rows(|| {
                query(
                    "MATCH (:ActiveProject {id: $project_id})-[:HAS_UNIT]->(t:TagUnit)
                     RETURN t.tag_id AS tag_id, t.filter_width AS filter_width,
                            t.filter_height AS filter_height, t.filter_depth AS filter_depth,
                            t.housing_width AS housing_width,
                            t.housing_height AS housing_height,
                            t.housing_length AS housing_length,
                            t.airflow_m3h AS airflow_m3h,
                            t.product_family AS product_family,
                            t.product_code AS product_code, t.weight_kg AS weight_kg,
                            t.quantity AS quantity, t.modules_needed AS modules_needed,
                            t.material_override AS material_override,
                            t.assembly_role AS assembly_role,
                            t.assembly_group_id AS assembly_group_id,
                            t.is_complete AS is_complete
                     ORDER BY t.tag_id",
                )
                .param("project_id", project_id(session_id))
            })
            .await?;
        let tags: Vec<TagRow> = tag_rows
            .iter()
            .map(|r| TagRow {
                tag_id: s(r, "tag_id"),
                filter_width: io(r, "filter_width"),
                filter_height: io(r, "filter_height"),
                filter_depth: io(r, "filter_depth"),
                housing_width: io(r, "housing_width"),
                housing_height: io(r, "housing_height"),
                housing_length: io(r, "housing_length"),
                airflow_m3h: io(r, "airflow_m3h"),
                product_family: so(r, "product_family"),
                product_code: so(r, "product_code"),
                weight_kg: fo(r, "weight_kg"),
                quantity: io(r, "quantity"),
                modules_needed: io(r, "modules_needed"),
                material_override: so(r, "material_override"),
                assembly_role: so(r, "assembly_role"),
                assembly_group_id: so(r, "assembly_group_id"),
                is_complete: bo(r, "is_complete").unwrap_or(false),
            })
            .collect();
        let tag_count = tags.len();
        Ok(ProjectState {
            session_id: session_id.to_string(),
            project: project.filter(|p| {
                p.name.is_some()
                    || p.locked_material.is_some()
                    || p.detected_family.is_some()
                    || !p.accessories.is_empty()
            }),
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
        let turn_id = format!("TURN_{session_id}_{turn_number}_{role}");
        let existing = self
            .rows(|| {
                query("MATCH (ct:ConversationTurn {id: $turn_id}) RETURN ct.created_at AS created_at")
                    .param("turn_id", turn_id.clone())
            })
            .await?;
        if let Some(created) = existing.first().and_then(|r| io(r, "created_at")) {
            if created > at_ms {
                return Err(GraphError::StaleWrite(format!(
                    "turn {turn_id} already written at {created}"
                )));
            }
        }
        let truncated: String = message.chars().take(MESSAGE_LIMIT).collect();
        self.run(|| {
            query(
                "MERGE (s:Session {id: $session_id})
                 SET s.last_active = timestamp()
                 MERGE (s)-[:WORKING_ON]->(p:ActiveProject {id: $project_id})
                 SET p.session_id = $session_id
                 MERGE (p)-[:HAS_TURN]->(ct:ConversationTurn {id: $turn_id})
                 SET ct.role = $role, ct.message = $message,
                     ct.turn_number = $turn_number,
                     ct.created_at = COALESCE(ct.created_at, $at_ms)",
            )
            .param("session_id", session_id)
            .param("project_id", project_id(session_id))
            .param("turn_id", turn_id.clone())
            .param("role", role)
            .param("message", truncated.clone())
            .param("turn_number", turn_number)
            .param("at_ms", at_ms)
        })
        .await
    }

    async fn get_recent_turns(&self, session_id: &str, n: usize) -> GraphResult<Vec<TurnRow>> {
        let limit = n as i64;
        let rows = self
            .rows(|| {
                query(
                    "MATCH (:ActiveProject {id: $project_id})-[:HAS_TURN]->(ct:ConversationTurn)
                     RETURN ct.role AS role, ct.message AS message,
                            ct.turn_number AS turn_number, ct.created_at AS created_at,
                            ct.judge_results AS judge_results
                     ORDER BY ct.turn_number DESC
                     LIMIT $n",
                )
                .param("project_id", project_id(session_id))
                .param("n", limit)
            })
            .await?;
        let mut turns: Vec<TurnRow> = rows
            .iter()
            .map(|r| TurnRow {
                role: s(r, "role"),
                message: s(r, "message"),
                turn_number: io(r, "turn_number").unwrap_or(0),
                created_at: io(r, "created_at").unwrap_or(0),
                judge_results: so(r, "judge_results"),
            })
            .collect();
        turns.reverse();
        Ok(turns)
    }

    async fn clear_session(&self, session_id: &str) -> GraphResult<()> {
        self.run(|| {
            query(
                "MATCH (s:Session {id: $session_id})
                 OPTIONAL MATCH (s)-[:WORKING_ON]->(p:ActiveProject)
                 OPTIONAL MATCH (p)-[:HAS_UNIT]->(t:TagUnit)
                 OPTIONAL MATCH (p)-[:HAS_TURN]->(ct:ConversationTurn)
                 DETACH DELETE ct, t, p, s",
            )
            .param("session_id", session_id)
        })
        .await?;
        tracing::info!(session_id = %session_id, "cleared session subgraph");
        Ok(())
    }

    async fn cleanup_stale_sessions(&self, max_age_ms: i64) -> GraphResult<u64> {
        let cutoff = now_ms() - max_age_ms;
        let rows = self
            .rows(|| {
                query(
                    "MATCH (s:Session)
                     WHERE s.last_active < $cutoff
                     OPTIONAL MATCH (s)-[:WORKING_ON]->(p:ActiveProject)
                     OPTIONAL MATCH (p)-[:HAS_UNIT]->(t:TagUnit)
                     OPTIONAL MATCH (p)-[:HAS_TURN]->(ct:ConversationTurn)
                     WITH s, p, t, ct, s.id AS sid
                     DETACH DELETE ct, t, p, s
                     RETURN count(DISTINCT sid) AS cleaned",
                )
                .param("cutoff", cutoff)
            })
            .await?;
        let cleaned = rows
            .first()
            .and_then(|r| io(r, "cleaned"))
            .unwrap_or(0)
            .max(0) as u64;
        if cleaned > 0 {
            tracing::info!(count = cleaned, "cleaned stale sessions");
        }
        Ok(cleaned)
    }

    async fn get_session_graph_data(&self, session_id: &str) -> GraphResult<SessionGraphData> {
        let rows = self
            .rows(|| {
                query(
                    "MATCH (s:Session {id: $session_id})
                     OPTIONAL MATCH (s)-[r1:WORKING_ON]->(p:ActiveProject)
                     OPTIONAL MATCH (p)-[r2:HAS_UNIT]->(t:TagUnit)
                     OPTIONAL MATCH (p)-[r3:USES_MATERIAL]->(m:Material)
                     OPTIONAL MATCH (p)-[r4:TARGETS_FAMILY]->(pf:ProductFamily)
                     OPTIONAL MATCH (t)-[r5:SIZED_AS]->(d:DimensionModule)
                     RETURN s.id AS s_id,
                            p.id AS p_id, p.name AS p_name,
                            t.id AS t_id, t.tag_id AS t_tag_id,
                            m.id AS m_id, m.code AS m_code,
                            pf.id AS pf_id, pf.name AS pf_name,
                            d.id AS d_id, d.label AS d_label",
                )
                .param("session_id", session_id)
            })
            .await?;
        let mut data = SessionGraphData::default();
        let mut seen = std::collections::HashSet::new();
        let mut rel_idx = 0usize;
        let mut push_node = |data: &mut SessionGraphData,
                             seen: &mut std::collections::HashSet<String>,
                             id: Option<String>,
                             label: &str,
                             name: String| {
            if let Some(id) = id {
                if seen.insert(id.clone()) {
                    data.nodes.push(GraphNode {
                        id: id.clone(),
                        labels: vec![label.to_string()],
                        name,
                        properties: Value::Null,
                    });
                }
                Some(id)
            } else {
                None
            }
        };
        for row in &rows {
            let s_id = push_node(
                &mut data,
                &mut seen,
                so(row, "s_id"),
                "Session",
                format!("Session: {session_id}"),
            );
            let p_id = push_node(
                &mut data,
                &mut seen,
                so(row, "p_id"),
                "ActiveProject",
                so(row, "p_name").unwrap_or_else(|| "Unnamed Project".into()),
            );
            let t_id = push_node(
                &mut data,
                &mut seen,
                so(row, "t_id"),
                "TagUnit",
                format!("Tag {}", so(row, "t_tag_id").unwrap_or_else(|| "?".into())),
            );
            let m_id = push_node(
                &mut data,
                &mut seen,
                so(row, "m_id"),
                "Material",
                so(row, "m_code").unwrap_or_default(),
            );
            let pf_id = push_node(
                &mut data,
                &mut seen,
                so(row, "pf_id"),
                "ProductFamily",
                so(row, "pf_name").unwrap_or_default(),
            );
            let d_id = push_node(
                &mut data,
                &mut seen,
                so(row, "d_id"),
                "DimensionModule",
                so(row, "d_label").unwrap_or_default(),
            );
            let mut push_rel = |from: &Option<String>, rel: &str, to: &Option<String>| {
                if let (Some(from), Some(to)) = (from, to) {
                    let key = format!("{from}-{rel}-{to}");
                    if seen.insert(key) {
                        data.relationships.push(GraphRel {
                            id: format!("r{rel_idx}"),
                            rel_type: rel.to_string(),
                            source: from.clone(),
                            target: to.clone(),
                        });
                        rel_idx += 1;
                    }
                }
            };
            push_rel(&s_id, "WORKING_ON", &p_id);
            push_rel(&p_id, "HAS_UNIT", &t_id);
            push_rel(&p_id, "USES_MATERIAL", &m_id);
            push_rel(&p_id, "TARGETS_FAMILY", &pf_id);
            push_rel(&t_id, "SIZED_AS", &d_id);
        }
        Ok(data)
    }
}

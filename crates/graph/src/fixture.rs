//! Reference dataset for tests and cold-start development
//!
//! Builds a small but complete HVAC filtration knowledge graph in a
//! [`MemoryGraph`]: environments with an IS_A hierarchy, stressors, traits,
//! causal rules, five product families with materials and variants, a logic
//! gate, a dependency rule, accessories, and installation constraints.
//! Mirrors the shape the ingestion pipeline produces in production.

use serde_json::json;

use crate::memory::MemoryGraph;

/// Build the reference knowledge graph
pub fn demo_graph() -> MemoryGraph {
    let g = MemoryGraph::new();

    // Environments (Layer 2) with IS_A hierarchy
    g.add_node("Environment", "ENV_INDOOR", json!({"name": "Indoor", "keywords": ["indoor", "inside"]}));
    g.add_node("Environment", "ENV_OUTDOOR", json!({"name": "Outdoor", "keywords": ["outdoor", "outside", "exterior"]}));
    g.add_node("Environment", "ENV_ROOFTOP", json!({"name": "Rooftop", "keywords": ["rooftop", "roof"]}));
    g.add_node("Environment", "ENV_KITCHEN", json!({"name": "Commercial Kitchen", "keywords": ["kitchen"]}));
    g.add_node("Environment", "ENV_POOL", json!({"name": "Pool Hall", "keywords": ["pool", "swimming"]}));
    g.add_edge("ENV_ROOFTOP", "IS_A", "ENV_OUTDOOR", json!({}));
    g.add_edge("ENV_KITCHEN", "IS_A", "ENV_INDOOR", json!({}));
    g.add_edge("ENV_POOL", "IS_A", "ENV_INDOOR", json!({}));

    // Applications
    g.add_node("Application", "APP_HOSPITAL", json!({"name": "Hospital", "keywords": ["hospital", "clinic", "surgery", "medical"]}));
    g.add_node("Application", "APP_KITCHEN", json!({"name": "Commercial Kitchen", "keywords": ["kitchen", "restaurant", "canteen"]}));
    g.add_node("Application", "APP_POOL", json!({"name": "Swimming Pool", "keywords": ["pool", "swimming", "spa"]}));

    // Stressors
    g.add_node("EnvironmentalStressor", "STR_CHLORINE", json!({
        "name": "Chlorine Vapour",
        "description": "Airborne chlorine compounds from water treatment",
        "category": "chlorine",
        "keywords": ["chlorine", "chloramine", "pool"],
    }));
    g.add_node("EnvironmentalStressor", "STR_GREASE", json!({
        "name": "Grease Aerosol",
        "description": "Airborne cooking grease droplets",
        "category": "grease",
        "keywords": ["grease", "frying", "fryer", "kitchen"],
    }));
    g.add_node("EnvironmentalStressor", "STR_CONDENSATION", json!({
        "name": "Condensation",
        "description": "Moisture condensing on cold housing surfaces",
        "category": "condensation",
        "keywords": ["condensation", "outdoor", "rooftop"],
    }));
    g.add_node("EnvironmentalStressor", "STR_DISINFECTANT", json!({
        "name": "Disinfectant Agents",
        "description": "Chlorine-based cleaning agents in clinical areas",
        "category": "corrosive",
        "keywords": ["disinfectant", "hospital", "sterile"],
    }));

    g.add_edge("APP_HOSPITAL", "EXPOSES_TO", "STR_DISINFECTANT", json!({}));
    g.add_edge("APP_KITCHEN", "EXPOSES_TO", "STR_GREASE", json!({}));
    g.add_edge("APP_POOL", "EXPOSES_TO", "STR_CHLORINE", json!({}));
    g.add_edge("ENV_KITCHEN", "EXPOSES_TO", "STR_GREASE", json!({}));
    g.add_edge("ENV_POOL", "EXPOSES_TO", "STR_CHLORINE", json!({}));
    g.add_edge("ENV_OUTDOOR", "EXPOSES_TO", "STR_CONDENSATION", json!({}));

    // Traits
    g.add_node("PhysicalTrait", "TRAIT_PARTICLE", json!({"name": "Particle Filtration"}));
    g.add_node("PhysicalTrait", "TRAIT_CARBON", json!({"name": "Carbon Adsorption"}));
    g.add_node("PhysicalTrait", "TRAIT_GREASE_PRE", json!({"name": "Grease Pre-Filtration"}));
    g.add_node("PhysicalTrait", "TRAIT_THERMAL", json!({"name": "Thermal Insulation"}));
    g.add_node("PhysicalTrait", "TRAIT_CORROSION_C5", json!({"name": "Corrosion Resistance C5"}));

    // Causal rules
    g.add_edge("STR_DISINFECTANT", "DEMANDS_TRAIT", "TRAIT_CORROSION_C5", json!({
        "severity": "CRITICAL",
        "explanation": "Chlorine-based disinfectants corrode unprotected steel; C5-rated material is required",
    }));
    g.add_edge("STR_CHLORINE", "DEMANDS_TRAIT", "TRAIT_CORROSION_C5", json!({
        "severity": "CRITICAL",
        "explanation": "Chlorine vapour attacks zinc coatings; corrosion class C5 is required",
    }));
    g.add_edge("STR_GREASE", "DEMANDS_TRAIT", "TRAIT_GREASE_PRE", json!({
        "severity": "CRITICAL",
        "explanation": "Grease aerosol saturates fine filters; a grease pre-stage is required",
    }));
    g.add_edge("STR_CONDENSATION", "DEMANDS_TRAIT", "TRAIT_THERMAL", json!({
        "severity": "CRITICAL",
        "explanation": "Temperature differential condenses moisture inside uninsulated housings",
    }));
    g.add_edge("TRAIT_CARBON", "NEUTRALIZED_BY", "STR_GREASE", json!({
        "severity": "CRITICAL",
        "explanation": "Grease clogs activated carbon pores within weeks, destroying adsorption capacity",
    }));

    // Materials
    g.add_node("Material", "MAT_FZ", json!({
        "code": "FZ", "name": "Galvanized steel", "corrosion_class": "C3",
        "corrosion_rank": 3.0, "chlorine_resistance_ppm": 0.1,
    }));
    g.add_node("Material", "MAT_ZM", json!({
        "code": "ZM", "name": "Zinc-magnesium steel", "corrosion_class": "C5",
        "corrosion_rank": 5.0, "chlorine_resistance_ppm": 0.8,
    }));
    g.add_node("Material", "MAT_RF", json!({
        "code": "RF", "name": "Stainless steel", "corrosion_class": "C5",
        "corrosion_rank": 5.0, "chlorine_resistance_ppm": 1.5,
    }));
    g.add_edge("MAT_RF", "PROVIDES_TRAIT", "TRAIT_CORROSION_C5", json!({}));
    g.add_edge("MAT_ZM", "PROVIDES_TRAIT", "TRAIT_CORROSION_C5", json!({}));

    // Product families (Layer 1)
    g.add_node("ProductFamily", "FAM_GDB", json!({
        "name": "GDB",
        "selection_priority": 10,
        "code_format": "{family}-{width}x{height}-{length}-{side}-{connection}-{material}",
        "service_access_factor": 0.5,
        "service_access_type": "front door swing",
        "allowed_environments": ["ENV_INDOOR"],
        "indoor_only": true,
        "corrosion_class": "C3",
    }));
    g.add_node("ProductFamily", "FAM_GDP", json!({
        "name": "GDP",
        "selection_priority": 20,
        "code_format": "{family}-{width}x{height}-{frame_depth}-{material}",
        "default_frame_depth": 50,
        "service_access_factor": 0.3,
        "allowed_environments": ["ENV_INDOOR"],
    }));
    g.add_node("ProductFamily", "FAM_GDF", json!({
        "name": "GDF",
        "selection_priority": 25,
        "service_access_factor": 0.4,
        "allowed_environments": ["ENV_INDOOR"],
    }));
    g.add_node("ProductFamily", "FAM_GDC", json!({
        "name": "GDC",
        "selection_priority": 30,
        "code_format": "{family}-{width}x{height}-{length}-{material}",
        "service_access_factor": 0.6,
        "allowed_environments": ["ENV_INDOOR"],
    }));
    g.add_node("ProductFamily", "FAM_GDMI", json!({
        "name": "GDMI",
        "selection_priority": 40,
        "code_format": "{family}-{width}x{height}-{length}-{material}",
        "service_access_factor": 0.5,
        "allowed_environments": ["ENV_INDOOR", "ENV_OUTDOOR"],
        "corrosion_class": "C4",
    }));
    g.add_node("ProductFamily", "FAM_GDR", json!({
        "name": "GDR",
        "selection_priority": 50,
        "service_access_factor": 0.4,
        "allowed_environments": ["ENV_OUTDOOR", "ENV_ROOFTOP"],
        "corrosion_class": "C4",
    }));

    // Direct traits
    g.add_edge("FAM_GDB", "HAS_TRAIT", "TRAIT_PARTICLE", json!({"primary": true}));
    g.add_edge("FAM_GDF", "HAS_TRAIT", "TRAIT_PARTICLE", json!({"primary": true}));
    g.add_edge("FAM_GDP", "HAS_TRAIT", "TRAIT_GREASE_PRE", json!({"primary": true}));
    g.add_edge("FAM_GDP", "HAS_TRAIT", "TRAIT_PARTICLE", json!({}));
    g.add_edge("FAM_GDC", "HAS_TRAIT", "TRAIT_CARBON", json!({"primary": true}));
    g.add_edge("FAM_GDMI", "HAS_TRAIT", "TRAIT_THERMAL", json!({"primary": true}));
    g.add_edge("FAM_GDMI", "HAS_TRAIT", "TRAIT_PARTICLE", json!({}));
    g.add_edge("FAM_GDR", "HAS_TRAIT", "TRAIT_THERMAL", json!({}));
    g.add_edge("FAM_GDR", "HAS_TRAIT", "TRAIT_PARTICLE", json!({}));

    // Material availability
    for fam in ["FAM_GDB", "FAM_GDP", "FAM_GDC", "FAM_GDMI", "FAM_GDF"] {
        g.add_edge(fam, "AVAILABLE_IN_MATERIAL", "MAT_FZ", json!({}));
        g.add_edge(fam, "AVAILABLE_IN_MATERIAL", "MAT_RF", json!({}));
    }
    g.add_edge("FAM_GDB", "AVAILABLE_IN_MATERIAL", "MAT_ZM", json!({}));
    g.add_edge("FAM_GDR", "AVAILABLE_IN_MATERIAL", "MAT_RF", json!({}));

    // Variants (per-family sizes with catalog airflow ratings)
    g.add_node("ProductVariant", "PV_GDB_300x300", json!({
        "name": "GDB-300x300", "width_mm": 300, "height_mm": 300,
        "reference_airflow_m3h": 850, "label": "1/4 module",
    }));
    g.add_node("ProductVariant", "PV_GDB_300x600", json!({
        "name": "GDB-300x600", "width_mm": 300, "height_mm": 600,
        "reference_airflow_m3h": 1700, "label": "1/2 module",
    }));
    g.add_node("ProductVariant", "PV_GDB_600x600", json!({
        "name": "GDB-600x600", "width_mm": 600, "height_mm": 600,
        "reference_airflow_m3h": 3400, "label": "1/1 module",
    }));
    g.add_node("ProductVariant", "PV_GDB_900x600", json!({
        "name": "GDB-900x600", "width_mm": 900, "height_mm": 600,
        "reference_airflow_m3h": 5000, "label": "1.5 module",
    }));
    for pv in ["PV_GDB_300x300", "PV_GDB_300x600", "PV_GDB_600x600", "PV_GDB_900x600"] {
        g.add_edge("FAM_GDB", "HAS_VARIANT", pv, json!({}));
    }
    // Weighted catalog rows for exact-variant weight lookup
    g.add_node("ProductVariant", "PV_GDB_600x600_550", json!({
        "name": "GDB-600x600-550", "width_mm": 600, "height_mm": 600,
        "housing_length_mm": 550, "weight_kg": 21.0,
    }));
    g.add_node("ProductVariant", "PV_GDB_300x600_550", json!({
        "name": "GDB-300x600-550", "width_mm": 300, "height_mm": 600,
        "housing_length_mm": 550, "weight_kg": 16.5,
    }));
    g.add_edge("FAM_GDB", "HAS_VARIANT", "PV_GDB_600x600_550", json!({}));
    g.add_edge("FAM_GDB", "HAS_VARIANT", "PV_GDB_300x600_550", json!({}));

    g.add_node("ProductVariant", "PV_GDF_600x600", json!({
        "name": "GDF-600x600", "width_mm": 600, "height_mm": 600,
        "reference_airflow_m3h": 6000, "label": "1/1 compact module",
    }));
    g.add_edge("FAM_GDF", "HAS_VARIANT", "PV_GDF_600x600", json!({}));

    g.add_node("ProductVariant", "PV_GDMI_600x600", json!({
        "name": "GDMI-600x600", "width_mm": 600, "height_mm": 600,
        "reference_airflow_m3h": 3400, "label": "1/1 insulated module",
    }));
    g.add_edge("FAM_GDMI", "HAS_VARIANT", "PV_GDMI_600x600", json!({}));

    g.add_node("ProductVariant", "PV_GDC_600x600", json!({
        "name": "GDC-600x600", "width_mm": 600, "height_mm": 600,
        "reference_airflow_m3h": 2500, "label": "1/1 carbon module",
    }));
    g.add_edge("FAM_GDC", "HAS_VARIANT", "PV_GDC_600x600", json!({}));

    // Dimension modules with the parametric weight model
    g.add_node("DimensionModule", "DIM_600x600", json!({
        "width_mm": 600, "height_mm": 600, "reference_airflow_m3h": 3400,
        "unit_weight_kg": 18.5, "weight_per_mm_length": 0.02,
        "reference_length_mm": 550, "label": "600x600",
    }));
    g.add_node("DimensionModule", "DIM_300x600", json!({
        "width_mm": 300, "height_mm": 600, "reference_airflow_m3h": 1700,
        "unit_weight_kg": 12.0, "weight_per_mm_length": 0.015,
        "reference_length_mm": 550, "label": "300x600",
    }));

    // Capacity rules
    g.add_node("CapacityRule", "CR_GDB", json!({
        "module_descriptor": "600x600", "input_requirement": "m³/h",
        "output_rating": 3400.0, "assumption": "1.5 m/s face velocity",
        "description": "3400 m³/h per 1/1 bag filter module",
    }));
    g.add_edge("FAM_GDB", "HAS_CAPACITY", "CR_GDB", json!({}));
    g.add_node("CapacityRule", "CR_GDF", json!({
        "module_descriptor": "600x600", "input_requirement": "m³/h",
        "output_rating": 6000.0, "assumption": "2.5 m/s face velocity",
        "description": "6000 m³/h per compact module",
    }));
    g.add_edge("FAM_GDF", "HAS_CAPACITY", "CR_GDF", json!({}));
    g.add_node("CapacityRule", "CR_GDMI", json!({
        "module_descriptor": "600x600", "input_requirement": "m³/h",
        "output_rating": 3400.0, "assumption": "1.5 m/s face velocity",
        "description": "3400 m³/h per insulated module",
    }));
    g.add_edge("FAM_GDMI", "HAS_CAPACITY", "CR_GDMI", json!({}));

    // Optimization strategy
    g.add_node("Strategy", "ST_GDB", json!({
        "name": "Widest first", "sort_property": "reference_airflow_m3h",
        "sort_order": "DESC", "primary_axis": "width", "secondary_axis": "height",
        "expansion_unit": "module",
    }));
    g.add_edge("FAM_GDB", "OPTIMIZATION_STRATEGY", "ST_GDB", json!({}));

    // Logic gate monitoring chlorine, demanding the ppm reading
    g.add_node("Parameter", "PARAM_CHLORINE", json!({
        "name": "Chlorine concentration", "property_key": "chlorine_ppm",
        "priority": 1, "question": "What is the chlorine concentration in the supply air (ppm)?",
        "unit": "ppm",
    }));
    g.add_node("LogicGate", "GATE_CHLORINE", json!({
        "name": "Chlorine Exposure Gate",
        "condition_logic": "chlorine_ppm >= 0.3",
        "physics_explanation": "Sustained chlorine above 0.3 ppm corrodes zinc coatings; C5-rated material is mandatory",
    }));
    g.add_edge("GATE_CHLORINE", "MONITORS", "STR_CHLORINE", json!({}));
    g.add_edge("GATE_CHLORINE", "REQUIRES_DATA", "PARAM_CHLORINE", json!({}));
    g.add_edge("APP_POOL", "TRIGGERS_GATE", "GATE_CHLORINE", json!({}));
    g.add_edge("ENV_POOL", "TRIGGERS_GATE", "GATE_CHLORINE", json!({}));

    // Playbook parameters and contextual clarification rules
    g.add_node("Parameter", "PARAM_AIRFLOW", json!({
        "name": "Airflow", "property_key": "airflow_m3h", "priority": 1,
        "question": "What airflow (m³/h) must the unit handle?", "unit": "m³/h",
    }));
    g.add_edge("FAM_GDB", "REQUIRES_PARAMETER", "PARAM_AIRFLOW", json!({}));
    g.add_node("ClarificationRule", "CLAR_POOL", json!({
        "name": "Pool water treatment disclosure",
    }));
    g.add_edge("CLAR_POOL", "TRIGGERED_BY_CONTEXT", "APP_POOL", json!({}));
    g.add_edge("CLAR_POOL", "DEMANDS_PARAMETER", "PARAM_CHLORINE", json!({}));

    // Dependency rule: grease mandates a protector stage before carbon
    g.add_node("DependencyRule", "DEP_GREASE_PROTECTION", json!({
        "dependency_type": "MANDATES_PROTECTION",
        "description": "Grease-laden air must pass a grease pre-filter stage before activated carbon",
        "protector_family_id": "FAM_GDP",
        "protector_family_name": "GDP",
    }));
    g.add_edge("DEP_GREASE_PROTECTION", "TRIGGERED_BY_STRESSOR", "STR_GREASE", json!({}));
    g.add_edge("DEP_GREASE_PROTECTION", "UPSTREAM_REQUIRES_TRAIT", "TRAIT_GREASE_PRE", json!({}));
    g.add_edge("DEP_GREASE_PROTECTION", "DOWNSTREAM_PROVIDES_TRAIT", "TRAIT_CARBON", json!({}));

    // Accessories: allow-list plus one explicit deny
    g.add_node("Accessory", "ACC_EXL", json!({"code": "EXL", "name": "Eccentric quick-release lock"}));
    g.add_node("Accessory", "ACC_L", json!({"code": "L", "name": "Left hinge"}));
    g.add_node("Accessory", "ACC_Polis", json!({"code": "Polis", "name": "After-filter rail"}));
    g.add_node("Accessory", "ACC_Bayonet", json!({"code": "Bayonet", "name": "Bayonet cartridge mount"}));
    for acc in ["ACC_EXL", "ACC_L", "ACC_Polis"] {
        g.add_edge("FAM_GDB", "HAS_COMPATIBLE_ACCESSORY", acc, json!({}));
    }
    g.add_edge("FAM_GDC", "HAS_COMPATIBLE_ACCESSORY", "ACC_Bayonet", json!({}));
    g.add_edge("FAM_GDC", "INCOMPATIBLE_WITH", "ACC_EXL", json!({
        "reason": "GDC uses a bayonet cartridge mount; EXL locks fit bag-filter frames only",
    }));

    // Installation constraints on GDB
    g.add_node("InstallationConstraint", "IC_GDB_ENV", json!({
        "constraint_type": "SET_MEMBERSHIP",
        "input_key": "installation_environment",
        "severity": "CRITICAL",
        "error_msg": "GDB housings are not rated for outdoor installation",
    }));
    g.add_edge("FAM_GDB", "HAS_INSTALLATION_CONSTRAINT", "IC_GDB_ENV", json!({}));
    g.add_node("InstallationConstraint", "IC_GDB_SERVICE", json!({
        "constraint_type": "COMPUTED_FORMULA",
        "dimension_key": "housing_length",
        "input_key": "available_space_mm",
        "severity": "CRITICAL",
        "error_msg": "Service access requires clearance of housing length times the access factor",
    }));
    g.add_edge("FAM_GDB", "HAS_INSTALLATION_CONSTRAINT", "IC_GDB_SERVICE", json!({}));
    g.add_node("InstallationConstraint", "IC_GDB_CHLORINE", json!({
        "constraint_type": "CROSS_NODE_THRESHOLD",
        "cross_property": "chlorine_resistance_ppm",
        "input_key": "chlorine_ppm",
        "material_context_key": "material",
        "severity": "CRITICAL",
        "error_msg": "Selected material cannot withstand the measured chlorine concentration",
    }));
    g.add_edge("FAM_GDB", "HAS_INSTALLATION_CONSTRAINT", "IC_GDB_CHLORINE", json!({}));

    // Variable features on GDB
    g.add_node("VariableFeature", "FEAT_CONNECTION", json!({
        "feature_name": "Duct connection",
        "parameter_name": "connection_type",
        "question": "Which duct connection should the housing have?",
        "why_needed": "Connection type changes the housing length and the product code",
        "auto_resolve": false,
    }));
    g.add_node("FeatureOption", "OPT_CONN_PG", json!({
        "value": "PG", "name": "Slide profile", "display_label": "Slide profile (PG)",
        "benefit": "Standard duct profile, no extra length", "is_default": true,
    }));
    g.add_node("FeatureOption", "OPT_CONN_F", json!({
        "value": "F", "name": "Flange", "display_label": "Flange (F)",
        "benefit": "Bolted airtight joint", "length_offset_mm": 50,
        "is_recommended": true,
    }));
    g.add_edge("FAM_GDB", "HAS_VARIABLE_FEATURE", "FEAT_CONNECTION", json!({}));
    g.add_edge("FEAT_CONNECTION", "HAS_OPTION", "OPT_CONN_PG", json!({}));
    g.add_edge("FEAT_CONNECTION", "HAS_OPTION", "OPT_CONN_F", json!({}));

    g.add_node("VariableFeature", "FEAT_SIDE", json!({
        "feature_name": "Door side",
        "parameter_name": "side",
        "question": "Which side should the access door open to?",
        "why_needed": "Hinge placement is fixed at manufacturing",
        "default_value": "R",
        "auto_resolve": true,
    }));
    g.add_edge("FAM_GDB", "HAS_VARIABLE_FEATURE", "FEAT_SIDE", json!({}));

    // Hard constraint: bag filters need at least the short housing
    g.add_node("HardConstraint", "HC_GDB_LENGTH", json!({
        "property_key": "housing_length", "operator": ">=", "value": 550.0,
        "error_msg": "Bag filters need at least the 550 mm housing",
    }));
    g.add_edge("FAM_GDB", "HAS_HARD_CONSTRAINT", "HC_GDB_LENGTH", json!({}));

    g
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::GraphReader;

    #[tokio::test]
    async fn test_demo_graph_families_ordered_by_priority() {
        let g = demo_graph();
        let families = g.get_all_product_families_with_traits().await.unwrap();
        assert!(families.len() >= 5);
        assert_eq!(families[0].product_id, "FAM_GDB");
        // RF-provided corrosion trait shows up in the material closure
        let gdb = &families[0];
        assert!(gdb.material_trait_ids.contains(&"TRAIT_CORROSION_C5".to_string()));
        assert!(gdb.all_trait_ids.contains(&"TRAIT_PARTICLE".to_string()));
    }

    #[tokio::test]
    async fn test_demo_graph_pool_exposes_chlorine() {
        let g = demo_graph();
        let stressors = g.get_stressors_for_application("APP_POOL").await.unwrap();
        assert!(stressors.iter().any(|s| s.id == "STR_CHLORINE"));
    }

    #[tokio::test]
    async fn test_demo_graph_rooftop_inherits_outdoor_stressors() {
        let g = demo_graph();
        let stressors = g
            .get_stressors_for_application("ENV_ROOFTOP")
            .await
            .unwrap();
        assert!(stressors.iter().any(|s| s.id == "STR_CONDENSATION"));
    }
}

//! Core types for the CPQ reasoning engine
//!
//! This crate provides foundational types used across all other crates:
//! - The engine verdict and its member types (stressors, rules, matches,
//!   gates, constraints, violations)
//! - The semantic intent extracted from user utterances
//! - The per-request engine context
//! - Session tag patches (merge-only field updates)
//! - Error types

pub mod context;
pub mod error;
pub mod intent;
pub mod tag;
pub mod verdict;

pub use context::EngineContext;
pub use error::{Error, Result};
pub use intent::{
    EntityReference, NumericConstraint, ScribeAction, SemanticIntent,
};
pub use tag::TagPatch;
pub use verdict::{
    AccessoryStatus, AccessoryValidation, AlternativeProduct, ApplicationContext,
    AssemblyStage, CapacityCalculation, CausalRule, ClarificationItem,
    ConstraintOverride, ConstraintType, DetectedStressor, DetectionMethod,
    EngineVerdict, FeatureOption, GateEvaluation, GateParameter, GateState,
    InstallationViolation, MissingParameter, RuleKind, Severity, SizingArrangement,
    StageRole, TraceStep, TraitMatch,
};

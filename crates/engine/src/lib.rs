//! Trait-based reasoning engine
//!
//! Evaluates product suitability by matching physical traits against
//! environmental stressors through causal rules stored in the knowledge
//! graph. No domain logic lives in this crate: every rule, trait, threshold,
//! and alternative comes from graph edges.
//!
//! Pipeline: stressor detection → causal rules → trait matching →
//! veto/assembly → hard constraints → logic gates → capacity → sizing →
//! variance check → accessories → installation constraints →
//! clarifications. Each phase appends to the reasoning trace, the
//! authoritative record for UI and debugging.

pub mod engine;
pub mod gates;
pub mod installation;
pub mod sizing;

pub use engine::TraitBasedEngine;
pub use gates::{evaluate_condition, GateEvalError};
pub use installation::evaluate_constraint;
pub use sizing::{arrange_modules, modules_needed};

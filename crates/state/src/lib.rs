//! Cumulative technical state
//!
//! The state is the append-only engineering specification of a session: it
//! grows with every turn and is never allowed to forget. The load-bearing
//! rule throughout is merge-only updates: a `None` never replaces a value.
//! That rule is what keeps the LLM's token-efficient restatement of context
//! from erasing an earlier decision.

pub mod prompt;
pub mod state;
pub mod tag;

pub use state::{AssemblyGroup, AssemblyStageMeta, StateSnapshot, TechnicalState};
pub use tag::TagSpecification;

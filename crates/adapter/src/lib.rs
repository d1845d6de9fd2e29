//! Verdict-to-report adapter
//!
//! Pure transforms over the engine verdict: no graph reads, no I/O. The
//! adapter produces the presentation-layer report and the prompt-injection
//! string, and is the single place where cross-section suppression rules
//! live (a blocking installation violation hides pivots, assemblies, and
//! clarification demands).

pub mod adapter;
pub mod injection;
pub mod report;

pub use adapter::VerdictAdapter;
pub use injection::prompt_injection;
pub use report::{
    ApplicationMatch, ClarificationQuestion, GraphReasoningReport, MaterialRequirement,
    ProductPivot, RiskType, RiskWarning, SuitabilityResult,
};

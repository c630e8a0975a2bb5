//! Aggregation Engine for Promptloom.
//!
//! Turns a caller's recent measurement scores into derived
//! [`CallerAttribute`](promptloom_core::CallerAttribute)s according to the
//! rules in active AGGREGATE specifications.

pub mod engine;
pub mod operator;

pub use engine::{AggregationEngine, AggregationReport, IssueKind, RuleIssue};
pub use operator::SourceScores;

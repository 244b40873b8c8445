//! Guardian supervision layer.
//!
//! Every final transcript flows through the per-session accumulator:
//! deterministic lexical sentiment, categorized risk-keyword matching, and
//! the auto-handoff predicate. The command bus listener delivers operator
//! takeover/release commands to whichever local controller owns the session,
//! fenced by a broker lock so a command window executes in exactly one
//! process.

pub mod bus;
pub mod risk;
pub mod sentiment;
pub mod supervisor;

pub use risk::{RiskClassifier, RiskScore};
pub use sentiment::compound_score;
pub use supervisor::{GuardianSupervisor, SessionStats, TakeoverCallback};

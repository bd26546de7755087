//! The agent loop for Sleuth.
//!
//! The controller follows a **Call → Parse → Act** cycle:
//!
//! 1. **Seed** the conversation: system prompt, prior history, the question
//! 2. **Call** the model through the fallback chain
//! 3. **Parse** exactly one XML-style tool call or completion signal
//! 4. **Act**: run a native or bridged tool, or delegate to a sub-agent,
//!    and feed the result back
//! 5. **Finish** on completion, optionally reshaping the answer to a JSON
//!    schema
//!
//! The loop ends on a completion signal or when the iteration budget runs
//! out, in which case a best-effort answer is returned.

pub mod compaction;
pub mod controller;
pub mod corrector;
pub mod delegate;
pub mod prompts;
pub mod protocol;
pub mod scheduler;
pub mod schema;
pub mod state;
pub mod token;

#[cfg(test)]
pub mod test_helpers;

pub use compaction::{CompactionPolicy, CompactionStats, compact};
pub use controller::{AgentAnswer, AgentLoop, AnswerRequest, LoopSettings};
pub use corrector::{CorrectionOutcome, SchemaCorrector, extract_json};
pub use delegate::{DELEGATE_TOOL, Delegator};
pub use prompts::Profile;
pub use protocol::{Completion, ParsedResponse, ToolSignature, parse_response};
pub use scheduler::{DelegationScheduler, DelegationTask, SchedulerConfig, SchedulerStats, TaskOutcome};
pub use schema::{SchemaViolation, validate};
pub use state::{IterationState, LoopPhase};

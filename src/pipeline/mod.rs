//! Rule dispatch pipeline.
//!
//! Every inbound event, whether from the chat source or a scheduler tick,
//! flows through:
//! 1. `Dispatcher::dispatch()`: snapshot the rules bound to the event's source
//! 2. `evaluator::evaluate()`: per-kind predicate and action, one per rule
//! 3. `ActionSink` / `ContentAnalyzer`: the only suspension points
//!
//! Rule failures (including panics) stay inside their own evaluation.

pub mod alerts;
pub mod dispatcher;
pub mod evaluator;
pub mod history;
pub mod registry;
pub mod report;
pub mod rules;
pub mod scheduler;
pub mod traits;
pub mod types;

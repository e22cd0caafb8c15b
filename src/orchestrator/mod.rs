//! The phase execution loop.
//!
//! [`Executor`] exposes three entry points: `execute_task`,
//! `resume_from_phase` and `finalize_task`. Each returns `Ok(())` when the
//! task completed, `ExecutorError::Interrupted` after a clean cancellation,
//! or `ExecutorError::TaskBlocked` when an operator has to act.
//! `execute_task` refuses a task that already ran with `ResumeRequired`.
//! Any other error is unexpected.

mod executor;
pub mod finalize;
mod rewind;

pub use executor::Executor;
pub use finalize::{FinalizeOptions, FinalizeReport, RiskLevel, classify_risk};

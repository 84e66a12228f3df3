//! Autonomous build-healing pipeline.
//!
//! Clones a repository, runs its tests in a locked-down sandbox, classifies
//! failures, asks a code-generation backend for corrected file content, and
//! lands the fixes via commit/push with a fix-branch + PR fallback, retrying
//! until tests pass or the retry budget runs out.

pub mod classify;
pub mod config;
pub mod diagnose;
pub mod fixgen;
pub mod github;
pub mod gitops;
pub mod judge;
pub mod orchestrator;
pub mod probe;
pub mod sandbox;
pub mod util;

//! attendance-runner — Runs the external recognition process.
//!
//! Resolves a working interpreter once at startup, then spawns one child per
//! submission with a wall-clock deadline, stream capture and bounded
//! concurrency.

pub mod interpreter;
pub mod process;

pub use interpreter::{
    check_import, check_imports, discover, probe, probe_all, Discovery, DiscoveryError, ImportCheck,
    Interpreter, Probe,
};
pub use process::{Admission, Runner, RunnerConfig, RunnerError, IMAGE_PATH_ENV};

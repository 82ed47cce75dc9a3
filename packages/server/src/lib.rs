// Deep Research Orchestration Server - core library
//
// This crate provides the research orchestration core: the planning ->
// parallel-research -> synthesis pipeline, the durable job infrastructure
// that drives it, and the embedded knowledge base it reads from and writes
// to. Transport adapters (stdio / HTTP tool-call protocols) mount the tool
// surface in `tools` and are wired externally.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod tools;

pub use config::*;

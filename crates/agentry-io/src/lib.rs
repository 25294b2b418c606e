//! Concrete adapters for Agentry's external interfaces.
//!
//! - [`LocalExecutor`]: project files and shell commands under one root
//! - [`OpenAiBackend`]: OpenAI-compatible chat completions over HTTP
//! - [`HttpSink`]: batched JSON delivery of run log records
//! - [`open_sinks`]: sinks built from a run's `logging` section

pub mod executor;
pub mod http_sink;
pub mod openai;
pub mod sinks;

pub use executor::LocalExecutor;
pub use http_sink::HttpSink;
pub use openai::{price_for, ModelPrice, OpenAiBackend, OpenAiConfig};
pub use sinks::{open_sink, open_sinks};

//! Takopi Core Library
//!
//! Shared functionality for Takopi components:
//! - Unified event taxonomy for coding-agent runs
//! - Protocol translators for the supported agent CLIs
//! - Resume-line conventions embedded in answer text
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod config;
pub mod error;
pub mod event;
pub mod protocol;
pub mod resume;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use event::{Action, ActionKind, EngineId, ResumeToken, RunResult, TakopiEvent, Usage};
pub use protocol::Translator;

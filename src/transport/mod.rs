//! Transports the engine can be driven by.
//!
//! The network-facing implementation lives with the application embedding
//! the engine; this crate ships the scripted one used by the CLI and tests.

mod replay;

pub use replay::{ReplayScript, ReplayTransport, ScriptedContext, ScriptedPage, SubmittedEvent};

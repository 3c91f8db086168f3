//! Built-in system administration tools for sita.
//!
//! Every tool declares a [`sita_agent_core::ToolContract`] and is executed only
//! through the registry; this crate also owns the quick-query vocabulary that
//! maps `?` payloads onto the fixed system fact tools.

pub mod tools;

pub use tools::*;

//! Admission control, budget settlement and stream relay for an LLM gateway.

mod error;
pub mod gateway;

pub use error::{DittoError, Result};

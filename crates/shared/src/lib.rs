//! Shared types for the SupportKit client SDK: the REST data model, the
//! realtime wire protocol and the error types both sides agree on.

pub mod models;
pub mod protocol;
pub mod error;

pub use models::*;
pub use protocol::*;
pub use error::*;

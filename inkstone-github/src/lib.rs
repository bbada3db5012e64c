//! GitHub backend for InkStone
//!
//! [`GitHubClient`] implements the engine's remote tree port over the GitHub
//! REST and Git-Data APIs with a bearer token.

pub mod client;
pub mod types;

pub use client::{GitHubClient, classify_status, decode_content};
pub use types::AccessReport;

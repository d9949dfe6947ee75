//! External controller MCP tools module
//!
//! One tool handler wrapping `ExternalServerController` sessions, on the RMCP 0.3.2 API.

pub mod controller_tools;
pub mod types;

pub use controller_tools::*;
pub use types::*;

//! Infrastructure: errors, telemetry, filesystem helpers, HTTP plumbing and the site manifest.

pub mod error;
pub mod fs;
pub mod http;
pub mod site;
pub mod telemetry;

//! HTTP plumbing: the outbound client and the admin API.

mod admin;
mod client;
mod middleware;

pub use admin::{AdminState, build_admin_router};
pub use client::{ClientLimits, USER_AGENT, build_client};
pub use middleware::{RequestId, log_responses, set_request_id};

//! Request context, rule chain, errors and scheduled jobs shared by the delivery components.

pub mod context;
pub mod error;
pub mod jobs;
pub mod request;
pub mod rules;

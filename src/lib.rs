//! spry: delivery cache and asset pipeline for a single origin.
//!
//! - [`cache`]: variation-keyed page cache with cascading purge and CDN fan-out
//! - [`assets`]: dependency-ordered CSS/JS graph, classification and content-addressed bundles
//! - [`preload`]: crawled preload recommendations with accept/reject memory

pub mod application;
pub mod assets;
pub mod cache;
pub mod cdn;
pub mod config;
pub mod infra;
pub mod preload;
pub mod util;

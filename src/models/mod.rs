//! Core data models for the gateway.
//!
//! Buckets are named views over backend containers; objects are immutable
//! physical units interpreted as versions of logical keys.

pub mod bucket;
pub mod object;

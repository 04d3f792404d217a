//! Windowgate - In-Process Sliding-Window Rate Limiting
//!
//! This crate implements per-identifier admission control for request handlers.
//! Each named policy caps how many requests an identifier may make within a
//! trailing time window; state lives in process memory only.

pub mod config;
pub mod error;
pub mod ratelimit;

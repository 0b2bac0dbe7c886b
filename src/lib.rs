//! liveorigin - HTTP origin and ingest server for live media
//!
//! This library crate exposes the server engine for embedding and for
//! integration testing.

pub mod config;
pub mod live;
pub mod server;

//! Liveorigin-Common: shared types, errors and utilities.
//!
//! This crate provides common functionality used across liveorigin:
//!
//! - **Error Handling**: the request-level error taxonomy and its HTTP mapping
//! - **Protocol Types**: closed enums for request methods and HTTP versions
//! - **Typed IDs**: counter-backed identifiers for sessions and producers
//! - **Path Utilities**: MIME type guessing and text/compressible detection
//!
//! # Examples
//!
//! ```
//! use liveorigin_common::{Error, Method, Result};
//! use liveorigin_common::paths::mime_for_path;
//!
//! assert_eq!(Method::parse("GET"), Some(Method::Get));
//! assert_eq!(mime_for_path("live/seg_1.m4s"), "video/iso.segment");
//!
//! fn example() -> Result<()> {
//!     Err(Error::not_found("/missing.mpd"))
//! }
//! assert_eq!(example().unwrap_err().http_status(), 404);
//! ```

pub mod error;
pub mod ids;
pub mod paths;
pub mod types;

pub use error::{Error, Result};
pub use ids::*;
pub use types::*;

//! liveorigin-http: the wire-level pieces the session engine relies on.
//!
//! The engine never touches raw request octets itself. This crate turns bytes
//! into a [`RequestHead`], negotiates byte ranges against known or growing
//! sizes, frames bodies (chunked transfer coding both ways), compresses small
//! text bodies and renders response heads, dates and directory listings.

pub mod chunked;
pub mod date;
pub mod encoding;
pub mod listing;
pub mod range;
pub mod request;
pub mod response;

pub use chunked::{encode_chunk, ChunkedDecoder, LAST_CHUNK};
pub use encoding::ContentEncoding;
pub use listing::ListingEntry;
pub use range::{negotiate, parse_content_range, ByteRange, RangePlan, RangeSpec, ResourceExtent};
pub use request::{parse_head, RequestHead, MAX_HEAD_SIZE, OPEN_RANGE_HEADER};
pub use response::{continue_head, ResponseHead};

//! liveorigin-vfs: storage bookkeeping shared by producers and readers.
//!
//! - [`MemStore`] holds named in-memory nodes. Readers hold counted handles;
//!   a node replaced or removed while read stays alive until the last handle
//!   is dropped.
//! - [`PinTable`] counts readers of on-disk files so time-shift deletions can
//!   be deferred until nothing is streaming them.

pub mod memfile;
pub mod pins;

pub use memfile::{MemReader, MemStore, MemWriter, NodeInfo};
pub use pins::{Pin, PinTable};

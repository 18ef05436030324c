//! Protocol Services
//!
//! Endpoint-level codecs and the per-connection services that speak them.

pub mod blobdb;
pub mod putbytes;
pub mod system;

pub use blobdb::{BlobDatabase, BlobDbService, BlobStatus};
pub use putbytes::{ObjectType, PutBytesService};
pub use system::{ProtocolCapability, SystemService, WatchInfo};

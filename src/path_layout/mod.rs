//! Path layout and filename codec (`spec.md` §4.A, component A).
//!
//! Maps logical file identifiers to on-disk paths and back: encoding a
//! freshly-written file's metadata into an opaque filename, decoding a
//! filename a client hands back to us, and picking which local store path
//! receives a new write.

pub mod filename;
pub mod store_path;

pub use filename::{decode, encode_logical_name, encode_trunk_name, trunk_directory_hash, FilenameFields, Location, LogicalName};
pub use store_path::{physical_path, PathSelector, StorePath};

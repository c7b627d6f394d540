//! In-memory OCI image support for kolite.
//!
//! This crate models layers, images, and multi-platform indexes as
//! self-contained values: layer bytes live in memory (or behind a lazy
//! thunk), manifests and digests are derived on demand. It also carries
//! the docker-archive codec and the registry client adapter.

pub mod archive;
pub mod image;
pub mod index;
pub mod layer;
pub mod media;
pub mod remote;
pub mod result;

pub use image::{Addendum, HistoryEntry, Image};
pub use index::{Index, IndexEntry};
pub use layer::{sha256_digest, sha256_hex, Layer};
pub use remote::{RegistryAuth, RegistryClient};
pub use result::BuildResult;

//! inkseal-storage: adapters for the collaborator traits in `inkseal-core`
//!
//! - [`OpendalObjectStore`]: encrypted blobs on any OpenDAL service (fs, s3, memory)
//! - [`JsonProfileDirectory`] / [`JsonMetadataStore`]: JSON records on an OpenDAL operator
//! - [`KeychainStore`] / [`FileKeyStore`] / [`MemoryKeyStore`]: device-local secrets

pub mod keystore;
pub mod object;
pub mod operator;
pub mod records;

pub use keystore::{FileKeyStore, KeychainStore, MemoryKeyStore};
pub use object::OpendalObjectStore;
pub use operator::{build_from_core_config, build_operator, memory_operator, S3Settings};
pub use records::{JsonMetadataStore, JsonProfileDirectory};

//! Encrypted, file-backed key/value mapping.
//! Values are sealed with AES-GCM under a salt key, the whole snapshot again under a
//! pepper key; keys come from key files, the OS keyring, or test doubles.

pub mod crypt;
pub mod error;
pub mod file_store;
pub mod key_material;
pub mod lock;
pub mod mapping;
pub mod options;
pub mod record;

pub use error::MappingError;
pub use mapping::EncryptedMapping;
pub use options::MappingOptions;

//! Core abstractions for vaultmap: the value model and the snapshot storage contract.
//! Kept free of cryptography so test doubles and alternative backends stay cheap.

pub mod storage;
pub mod value;

pub use value::Value;

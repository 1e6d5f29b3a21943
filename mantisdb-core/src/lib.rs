//! MantisDB core — configuration and the crate-wide error type.
//!
//! Every other workspace member depends on this crate for `MantisConfig`
//! (§10.3) and `MantisError` (§10.2). It deliberately carries no storage,
//! cache, or façade logic of its own — those live in `mantisdb-storage`,
//! `mantisdb-cache`, and `mantisdb-store` respectively.

pub mod config;
pub mod error;

pub use config::MantisConfig;
pub use error::{MantisError, MantisResult};

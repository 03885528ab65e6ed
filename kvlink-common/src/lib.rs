// kvlink-common - Shared status codes, errors and configuration for kvlink
//
// This crate defines the vocabulary the client crate reports results in

pub mod config;
pub mod error;
pub mod status;

// Re-export for convenience
pub use config::*;
pub use error::*;
pub use status::*;

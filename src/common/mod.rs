pub mod binary;
pub mod cache;
pub mod cert;
pub mod env;
pub mod fetch;
pub mod file;
pub mod hash;
pub mod hex_serde;

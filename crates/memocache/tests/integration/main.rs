// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod caching;
pub mod config;
pub mod redis_storage;
pub mod utils;

pub use utils::*;

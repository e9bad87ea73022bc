pub mod api;
pub mod cfg;
pub mod connector;
pub mod contracts;
pub mod crypto;
pub mod db;
pub mod error;
pub mod forge;
pub mod launcher;
pub mod migration;
pub mod pool;
pub mod ratelimit;
pub mod registry;
pub mod serde_util;
pub mod service;
pub mod test_util;

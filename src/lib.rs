pub mod api;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod extract;
pub mod mounts;
pub mod restore;
pub mod runtime;
pub mod snapshot;
pub mod state;
pub mod storage;
pub mod types;

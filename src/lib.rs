// Media Assistant - Library Entry Point
//
// Local media asset index: roots are scanned and watched, every file is
// recorded in SQLite and parsed by a bounded worker pool.

pub mod constants;
pub mod error;
pub mod config;
pub mod tools;
pub mod db;
pub mod store;
pub mod hash;
pub mod metadata;
pub mod preview;
pub mod parsers;
pub mod ingest;
pub mod jobs;
pub mod events;
pub mod engine;

pub use config::{EngineConfig, RootConfig};
pub use engine::{Engine, Library};
pub use error::{MediaError, Result};

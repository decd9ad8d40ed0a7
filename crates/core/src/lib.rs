//! Core crate for the reelqueue generation front door.

pub mod completion;
pub mod config;
pub mod dedup;
pub mod error;
pub mod key_lock;
pub mod ledger;
pub mod logging;
pub mod queue;
pub mod retry;
pub mod server;
pub mod storage;
pub mod submission;
pub mod upstream;

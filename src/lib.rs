#![deny(missing_docs)]

//! An in-memory, string-keyed key-value store served over named pipes.
//!
//! The store is a sharded hash table shared by two kinds of clients:
//! batch job files processed by a worker pool (with periodic on-disk
//! backups), and long-lived interactive sessions that connect over
//! FIFOs and receive asynchronous notifications when keys they have
//! subscribed to change or disappear.

mod backup;
mod client;
mod error;
mod jobs;
mod parser;
pub mod protocol;
mod server;
mod store;
mod subs;

pub use backup::{backup_path, BackupEngine};
pub use client::{session_pipes, KvsClient, NotificationListener};
pub use error::{KvsError, Result};
pub use jobs::{scan_jobs, JobRunner};
pub use parser::{parse_client_command, parse_command, ClientCommand, Command};
pub use protocol::SessionPipes;
pub use server::{create_fifo, KvsServer, Shutdown};
pub use store::{DeleteOutcome, KvStore, KVS_ERROR, KVS_MISSING, TABLE_SIZE};
pub use subs::{Session, SessionTable, MAX_SESSION_COUNT, MAX_SUBS};

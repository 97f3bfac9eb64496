//! # ratchet-core
//!
//! A durable job queue backed by a PostgreSQL table and session advisory
//! locks. Producers insert rows with [`Client::enqueue`]; workers claim the
//! next eligible row with [`Client::lock_job`], which pins a pooled
//! connection, opens a transaction on it, and advisory-locks the row id.
//! The returned [`LockedJob`] holds that connection until the job is
//! deleted, marked failed, or released, so a worker crash can never leave a
//! job claimed: the lock dies with the session.

// Types
mod types;
pub use types::Bytes;
pub use types::Job;
pub use types::NewJob;
pub use types::DEFAULT_PRIORITY;

// Errors
mod error;
pub use error::DatabaseError;

// Client
mod client;
pub use client::Client;

// Job handle
mod job;
pub use job::LockedJob;

// Retry backoff
mod retry;
pub use retry::RetryPolicy;
pub use retry::RetryPolicyBuilder;

// Config
mod config;
pub use config::PoolConfig;

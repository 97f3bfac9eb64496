//! # ratchet-worker
//!
//! Runs jobs claimed through a [`ratchet_core::Client`] against a registry
//! of per-type handlers. A [`WorkerPool`] fans out N workers over the shared
//! client; each worker claims a job, dispatches on its type, settles the
//! claim from the handler's outcome, and loops, sleeping a wake interval
//! whenever its queue is empty.

// Handler registry
mod registry;
pub use registry::JobHandler;
pub use registry::JobRegistry;

// Worker pool
mod worker;
pub use worker::WorkerPool;
pub use worker::WorkerPoolConfig;

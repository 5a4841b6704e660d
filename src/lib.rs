// src/lib.rs
//! Parallel file-system metadata and bandwidth benchmark.
//!
//! A run is a group of ranks (threads sharing a [`comm::LocalGroup`])
//! executing the same phases in lock step against one [`backend::Backend`].

pub mod backend; // Storage backend trait and capability flags
pub mod buffers; // Aligned I/O buffers and the verification pattern
pub mod comm; // Collectives and point-to-point messages between ranks
pub mod config;
pub mod constants;
pub mod context;
pub mod error;
pub mod metrics; // Per-item latency histograms
pub mod namespace; // Directory tree shape and item naming
pub mod phases; // Metadata phase executor
pub mod posix;
pub mod stats; // Rate reduction and summary tables
pub mod stonewall;
pub mod timebase;
pub mod transfer; // File-per-process bandwidth phase
pub mod tsv_export; // TSV export for machine-readable results
pub mod walker; // Parallel find / delete

pub use config::RunConfig;
pub use error::BenchError;

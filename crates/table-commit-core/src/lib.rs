//! Snapshot commit and rewrite coordination for an immutable-file table format.
//!
//! A table is a sequence of immutable snapshots, each naming the manifests
//! that list its data files. This crate provides:
//!
//! - An optimistic snapshot commit protocol: operations are turned into new
//!   snapshots and installed with a compare-and-swap on a metadata store,
//!   retried on conflict with bounded backoff (`commit` module).
//! - A metadata store contract with a file-backed implementation that
//!   publishes numbered metadata files with create-new semantics
//!   (`metadata_store` module).
//! - Rewrite coordination: committing or aborting rewritten file groups,
//!   and a background commit service for partial progress (`rewrite`
//!   module).
//! - A commit-file exchange through which distributed write tasks hand
//!   their output to a job coordinator (`exchange` module).
//! - Scan metrics with a JSON codec (`metrics` module).
//!
//! The physical data-file writer is not part of this crate; rewrites plug
//! one in through [`rewrite::GroupRewriter`].
#![deny(missing_docs)]
pub mod commit;
pub mod config;
pub mod exchange;
pub mod io;
pub mod metadata_store;
pub mod metrics;
pub mod model;
pub mod rewrite;
pub mod storage;
pub mod table;

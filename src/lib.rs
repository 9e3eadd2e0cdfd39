//! Download orchestration engine for a segmented media platform.
//!
//! The engine signs requests against the upstream web API, resolves an
//! item into its ordered audio segments, downloads and merges them into a
//! single artifact, and reports live progress through a concurrency-safe
//! task registry. Finished artifacts can be served with byte-range
//! support through [`stream`].
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod config;
pub mod download;
pub mod error;
pub mod gateway;
pub mod http;
pub mod merge;
pub mod protocol;
pub mod registry;
pub mod stream;
pub mod task;
pub mod transcript;
pub mod util;
pub mod wbi;

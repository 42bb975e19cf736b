//! # Virtual machine disk image importer
//!
//! This crate populates storage volumes from virtual machine disk images:
//! it fetches an image through a transport provider, unwraps compression,
//! archive and image encoding layers, and writes the raw disk to a
//! destination under a capacity bound. A controller turns annotated volume
//! requests into workers that each run one such import.

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![forbid(unused_must_use)]
#![deny(unsafe_code)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]

pub mod annotations;
pub mod cli;
pub mod config;
pub mod controller;
pub mod copy;
pub mod error;
pub mod format;
pub mod k8sapitypes;
pub mod options;
mod skopeo;
pub mod tokio_util;
pub mod transport;
pub mod worker;

#[cfg(any(test, feature = "internal-testing-api"))]
pub mod fixture;

pub use copy::{CopyEngine, CopyOutcome};
pub use error::ImportError;
pub use options::ImportOptions;

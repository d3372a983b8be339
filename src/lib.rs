//! Transactional mod staging for fixed-layout game content directories:
//! screen incoming files, detect resource overlaps, lay out a numbered load
//! order, and publish it into the live directory with backup and rollback.

pub mod backup;
pub mod checksum;
pub mod config;
pub mod conflict;
pub mod container;
pub mod deploy;
pub mod error;
pub mod fsutil;
pub mod game;
pub mod load_order;
pub mod logging;
pub mod pysyntax;
pub mod scanner;
pub mod screening;

pub use error::{ErrorKind, ModError, Result};

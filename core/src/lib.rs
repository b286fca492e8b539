//! Core library for agtop
//!
//! This crate contains the pieces of the run supervision engine that do not
//! own OS processes:
//! - Run model, state machine and the shared run registry
//! - Bounded log buffers (raw lines and parsed entries)
//! - Session persistence
//! - The command safety guard
//! - Configuration

pub mod buffer;
pub mod config;
pub mod error;
pub mod notify;
pub mod run;
pub mod safety;

pub use config::AgtopConfig;
pub use error::Error;
pub use notify::ChangeNotifier;
pub type Result<T> = std::result::Result<T, Error>;

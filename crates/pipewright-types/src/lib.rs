//! Pure data types for pipewright — process specs, exit status, pipeline errors.
//!
//! This crate is a leaf dependency with no async runtime and no I/O.
//! It exists so that callers can name pipewright's error taxonomy and
//! process descriptions without pulling in tokio.

pub mod error;
pub mod spec;
pub mod status;

// Flat re-exports for convenience
pub use error::*;
pub use spec::*;
pub use status::*;

//! Concrete job payloads.

mod import;

pub use import::ImportJob;

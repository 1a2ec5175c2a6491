//! Core types, constants, and traits.
//!
//! This module has no optional dependencies and defines the abstractions
//! shared by the transport engine and the runtime.

mod config;
mod constants;
mod error;
mod traits;

pub use config::*;
pub use constants::*;
pub use error::*;
pub use traits::*;

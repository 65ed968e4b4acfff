//! The `utils` module provides a collection of utility functions and common
//! definitions used across the crate: the shared error type, logging
//! bootstrap and the bit/byte helpers the codec is built on.

pub mod binary;
pub mod error;
pub mod logging;

pub use error::{MqttError, Result};

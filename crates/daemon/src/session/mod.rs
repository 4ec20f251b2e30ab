//! Client session management.
//!
//! This module tracks which connections belong to which logical client and
//! picks the connection each frame goes to.

pub mod registry;

pub use registry::{ClientRegistry, ClientSession};

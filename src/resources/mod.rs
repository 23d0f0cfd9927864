//! Resource management
//!
//! Owned GPU resource wrappers, the registry that creates them, and mesh data.

mod handle;
mod mesh;

pub use handle::*;
pub use mesh::*;

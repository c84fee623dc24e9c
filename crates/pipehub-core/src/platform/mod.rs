//! Platform abstraction layer.
//!
//! All `#[cfg]` blocks for OS-specific behavior live here rather than being
//! scattered through the hub and client code.
//!
//! - `paths` - runtime directory for sockets and lock files
//! - `endpoint` - the named local transport (Unix socket / Windows named pipe)
//!
//! # Supported Platforms
//!
//! - **Linux / macOS**: Unix domain sockets
//! - **Windows**: named pipes

pub mod endpoint;
pub mod paths;

pub use paths::default_runtime_dir;

//! Rune executor - runs build steps in containers
//!
//! The executor sits between the build scheduler and the container runtime.
//! For every step it:
//!
//! - Acquires the root and auxiliary mounts and unwinds them in reverse
//! - Resolves the step's user to a UID/GID set or a Windows SID, looking
//!   the name up inside the image when the host cannot
//! - Creates the working directory with the right owner
//! - Assembles the OCI runtime spec for the host platform
//! - Hands the task to the runtime and waits for it to exit

pub mod config;
pub mod error;
pub mod executor;
pub mod fsutil;
pub mod identity;
pub mod mount;
pub mod network;
pub mod platform;
pub mod release;
pub mod spec;

pub use error::{ExecutorError, Result};

//! Operating System specific abstractions
//!

pub mod cleanup;
pub use cleanup::{install_signal_cleanup, release_all, CLEANUP_SIGNALS};

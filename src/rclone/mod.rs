//! rclone integration / rclone 集成
//!
//! Subprocess transfers with output parsing, the rc HTTP client and the managed
//! `rclone rcd` server.

pub mod cli;
pub mod command;
pub mod process;
pub mod progress;
pub mod rc;
pub mod server;

pub use rc::{RcApi, RcClient, RcError};
pub use server::RcServer;

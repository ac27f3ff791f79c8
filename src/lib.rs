pub mod config;
pub mod db;
pub mod error;
pub mod rclone;
pub mod remotes;
pub mod task;
pub mod utils;

pub mod types;
pub mod models;
pub mod lifecycle;
pub mod registry;
pub mod store;
pub mod poller;
pub mod manager;

pub use types::*;
pub use models::*;
pub use manager::*;

pub mod cache;
pub mod client;
pub mod error;
pub mod monitor;
pub mod types;

pub use cache::*;
pub use client::*;
pub use error::*;
pub use monitor::*;
pub use types::*;

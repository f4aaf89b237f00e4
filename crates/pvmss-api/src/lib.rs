pub mod error;
pub mod forms;
pub mod i18n;
pub mod middleware;
pub mod render;
pub mod routes;
pub mod state;

pub use error::*;
pub use state::*;

pub use routes::build_router;

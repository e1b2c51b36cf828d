pub mod app;
pub mod error;

pub use app::{create_app, AppState};
pub use error::ApiError;

pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod repositories;
pub mod services;
pub mod state;

pub use error::AppError;
pub use state::AppState;

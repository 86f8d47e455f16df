// src/lib.rs
pub mod config;
pub mod database;
pub mod dtos;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod state;
pub mod upload;

pub use config::AppConfig;
pub use routes::create_router;
pub use state::AppState;

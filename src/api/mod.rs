//! Local control API
//!
//! A small axum server that lets the host (or a push relay) drive a running
//! daemon and read back what the user would see.

mod error;
pub mod models;
mod server;
pub mod services;
pub mod state;
pub(crate) mod utils;

pub use error::ApiError;
pub use server::{router, run};
pub use state::AppState;

pub mod broadcast;
pub mod config;
pub mod registry;

mod app_state;
mod auth;
mod routes;
mod ws;

pub use app_state::AppState;
pub use routes::build_router;

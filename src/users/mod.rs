//! User accounts: the model, its rules and roles, and the HTTP surface.

use axum::Router;

use crate::state::AppState;

pub mod audit;
pub mod avatar;
pub mod capabilities;
pub mod dto;
pub mod handlers;
pub mod mem;
pub mod model;
pub mod notify;
pub mod repo;
pub mod roles;
pub mod rules;
pub mod service;

pub use model::{User, UserView};

pub fn router() -> Router<AppState> {
    handlers::user_routes()
}

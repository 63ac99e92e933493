mod dto;
mod extract;
mod handlers;
mod middleware;
mod routes;
mod stream;

pub use routes::{AppState, create_router};

//! HTTP and WebSocket surface.

mod audio;
mod routes;
mod state;
mod websocket;

pub use routes::run_server;
pub use state::ServerState;

//! Server binary support: application state, session lifecycle, transports
//! bound to the speech pipeline, and the HTTP/WebSocket surface.

pub mod http;
pub mod rate_limit;
pub mod session;
pub mod state;
pub mod websocket;

pub use http::create_router;
pub use rate_limit::RateLimiter;
pub use session::{Session, SessionStore};
pub use state::AppState;

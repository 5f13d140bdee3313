//! HTTP Server
//!
//! The internal `/api` surface plus the dispatcher that routes everything
//! else to plugins and apps.

mod api;
mod handler;
mod router;
mod state;
mod ws;

pub use handler::dispatch;
pub use router::create_router;
pub use state::AppState;

//! WebSocket endpoint
//!
//! One listener serves both connection kinds. A connection claiming a
//! server id (`x-server-id` header) is an agent and must pass token
//! authentication before the upgrade completes; anything else is a browser
//! and must present a valid session cookie. Rejections happen at the HTTP
//! layer with a 401, never after the upgrade.

mod agent;
mod browser;
mod listener;

pub use listener::{router, serve};

//! Authentication
//!
//! Agent connections authenticate with bearer tokens (or loopback origin
//! for the core server); browser connections authenticate with a session
//! cookie validated by an external auth service. All failures fail closed.

mod browser;
mod tokens;

pub use browser::{BrowserAuth, HttpBrowserAuth};
pub use tokens::{legacy_token_hash, AgentAuthenticator};

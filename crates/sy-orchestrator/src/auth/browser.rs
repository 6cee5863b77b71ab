//! Browser session authentication
//!
//! Browser connections carry a session cookie; an external auth service
//! owns passwords and sessions, the orchestrator only asks it whether a
//! cookie is valid.

use async_trait::async_trait;

/// Validates browser session cookies.
#[async_trait]
pub trait BrowserAuth: Send + Sync {
    /// Returns the authenticated user id, or None when the cookie is
    /// missing, expired, or forged.
    async fn validate(&self, cookie: &str) -> Option<String>;
}

/// Validation against an external HTTP auth service.
pub struct HttpBrowserAuth {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpBrowserAuth {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl BrowserAuth for HttpBrowserAuth {
    async fn validate(&self, cookie: &str) -> Option<String> {
        let response = match self
            .client
            .get(&self.endpoint)
            .header(reqwest::header::COOKIE, cookie)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "Auth service unreachable, failing closed");
                return None;
            }
        };

        if !response.status().is_success() {
            return None;
        }

        #[derive(serde::Deserialize)]
        struct Session {
            user_id: String,
        }

        match response.json::<Session>().await {
            Ok(session) => Some(session.user_id),
            Err(e) => {
                tracing::warn!(error = %e, "Auth service returned an unreadable session");
                None
            }
        }
    }
}

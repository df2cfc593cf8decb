use std::fmt;
use std::time::Duration;

use dispatch_protocol::{LoginConfig, LoginRequest, LoginResponse, Role};
use tracing::{info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Login failures, worded for display next to the login form.
#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("Please enter both username and password.")]
    MissingCredentials,
    #[error("{0}")]
    Rejected(String),
    #[error("Invalid user type.")]
    UnknownUserType,
    #[error("Something went wrong. Please try again.")]
    Transport(#[source] reqwest::Error),
}

/// Successful login: the bearer token and the page the user is routed to.
#[derive(Clone, PartialEq, Eq)]
pub struct LoginSession {
    pub username: String,
    pub role: Role,
    pub token: String,
}

impl fmt::Debug for LoginSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginSession")
            .field("username", &self.username)
            .field("role", &self.role)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct LoginClient {
    http: reqwest::Client,
    endpoint: String,
}

impl LoginClient {
    pub fn new(config: &LoginConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Post credentials and route the user by username.
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginSession, LoginError> {
        let username = username.trim();
        if username.is_empty() || password.trim().is_empty() {
            return Err(LoginError::MissingCredentials);
        }

        let request = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        let response = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                warn!(endpoint = %self.endpoint, "Login request failed: {e}");
                LoginError::Transport(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            // Error replies may still carry a message worth showing.
            let body = response.json::<LoginResponse>().await.unwrap_or_default();
            warn!(%status, username, "Login rejected");
            return Err(LoginError::Rejected(
                body.message
                    .unwrap_or_else(|| "Something went wrong. Please try again.".to_string()),
            ));
        }

        let body: LoginResponse = response.json().await.map_err(|e| {
            warn!(endpoint = %self.endpoint, "Unreadable login response: {e}");
            LoginError::Transport(e)
        })?;

        let Some(token) = body.token.filter(|t| !t.is_empty()) else {
            return Err(LoginError::Rejected(
                body.message
                    .unwrap_or_else(|| "Invalid credentials.".to_string()),
            ));
        };

        let role = Role::from_username(username).ok_or(LoginError::UnknownUserType)?;
        info!(username, %role, "Login successful");
        Ok(LoginSession {
            username: username.to_string(),
            role,
            token,
        })
    }
}

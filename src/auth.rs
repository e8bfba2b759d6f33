//! OAuth token exchange
//!
//! The feed authenticates every RPC with a bearer token plus the tenant's
//! instance URL and org id. Tokens come from the platform's OAuth token
//! endpoint; both the client-credentials and the username-password grants
//! are supported. Tokens are cached until the server rejects one, at which
//! point the session invalidates the cache and the next call re-fetches.

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{FeedError, Result};

/// OAuth grant flavor.
#[derive(Debug, Clone)]
pub enum OAuthGrant {
    /// `client_credentials` grant using only the client id and secret.
    ClientCredentials,
    /// `password` grant. The security token is appended to the password
    /// when set, as the platform requires outside trusted IP ranges.
    Password {
        username: String,
        password: String,
        security_token: Option<String>,
    },
}

/// Configuration for the token provider.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    login_url: String,
    client_id: String,
    client_secret: String,
    grant: OAuthGrant,
}

impl OAuthConfig {
    /// Configure a client-credentials grant against the given login host
    /// (e.g. `https://login.salesforce.com` or a My Domain URL).
    pub fn client_credentials(
        login_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            login_url: login_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            grant: OAuthGrant::ClientCredentials,
        }
    }

    /// Configure a username-password grant.
    pub fn password(
        login_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            login_url: login_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            grant: OAuthGrant::Password {
                username: username.into(),
                password: password.into(),
                security_token: None,
            },
        }
    }

    /// Append a security token to the password grant.
    pub fn with_security_token(mut self, token: impl Into<String>) -> Self {
        if let OAuthGrant::Password { security_token, .. } = &mut self.grant {
            *security_token = Some(token.into());
        }
        self
    }

    fn token_url(&self) -> String {
        format!(
            "{}/services/oauth2/token",
            self.login_url.trim_end_matches('/')
        )
    }
}

/// A fetched access token with the call-credential fields derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    /// Value for the `accesstoken` metadata key, `Bearer ` prefix included.
    pub bearer: String,
    /// Value for the `instanceurl` metadata key.
    pub instance_url: String,
    /// Value for the `tenantid` metadata key (the org id).
    pub tenant_id: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    instance_url: String,
    /// Identity URL; its second-to-last path segment is the org id.
    id: String,
}

impl TokenResponse {
    fn tenant_id(&self) -> Result<String> {
        let mut segments = self.id.trim_end_matches('/').rsplit('/');
        segments.next();
        segments
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                FeedError::auth(format!("identity url {:?} has no org id segment", self.id))
            })
    }
}

/// Caching token provider.
pub struct TokenProvider {
    config: OAuthConfig,
    client: reqwest::Client,
    cached: RwLock<Option<AccessToken>>,
}

impl TokenProvider {
    pub fn new(config: OAuthConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            cached: RwLock::new(None),
        }
    }

    /// Get a token, fetching one if none is cached.
    pub async fn token(&self) -> Result<AccessToken> {
        if let Some(token) = self.cached.read().await.clone() {
            return Ok(token);
        }

        let mut cached = self.cached.write().await;
        // Another task may have fetched while we waited for the write lock.
        if let Some(token) = cached.clone() {
            return Ok(token);
        }

        let token = self.fetch().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Drop the cached token. The next `token` call fetches a fresh one.
    pub async fn invalidate(&self) {
        warn!("invalidating cached access token");
        *self.cached.write().await = None;
    }

    async fn fetch(&self) -> Result<AccessToken> {
        let mut form = vec![
            ("client_id", self.config.client_id.clone()),
            ("client_secret", self.config.client_secret.clone()),
        ];
        match &self.config.grant {
            OAuthGrant::ClientCredentials => {
                form.push(("grant_type", "client_credentials".to_string()));
            }
            OAuthGrant::Password {
                username,
                password,
                security_token,
            } => {
                form.push(("grant_type", "password".to_string()));
                form.push(("username", username.clone()));
                let mut password = password.clone();
                if let Some(token) = security_token {
                    password.push_str(token);
                }
                form.push(("password", password));
            }
        }

        let url = self.config.token_url();
        debug!(%url, "fetching access token");
        let response = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| FeedError::auth(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::auth(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| FeedError::auth(format!("malformed token response: {e}")))?;
        let tenant_id = parsed.tenant_id()?;

        Ok(AccessToken {
            bearer: format!("Bearer {}", parsed.access_token),
            instance_url: parsed.instance_url,
            tenant_id,
        })
    }
}

impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenProvider")
            .field("login_url", &self.config.login_url)
            .finish()
    }
}

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;

use crate::config::GitHubConfig;
use crate::error::{ExporterError, Result};

/// Installation tokens are renewed this long before they expire.
const TOKEN_RENEWAL_MARGIN_SECONDS: i64 = 60;

/// Bearer token used to authenticate against the GitHub API.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Token(***)")
    }
}

/// GitHub App installation credentials.
#[derive(Clone)]
pub struct AppCredentials {
    pub app_id: u64,
    pub installation_id: u64,
    key: EncodingKey,
}

/// How requests are authenticated.
///
/// A personal token takes precedence over GitHub App credentials; without
/// either the exporter runs unauthenticated with a much lower rate limit.
#[derive(Clone)]
pub enum Credentials {
    Token(Token),
    App(AppCredentials),
    Anonymous,
}

impl Credentials {
    /// Selects the credentials to use from the GitHub configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the GitHub App private key cannot be
    /// read or is not a valid RSA PEM key.
    pub fn from_config(config: &GitHubConfig) -> Result<Self> {
        if let Some(token) = config.token.as_deref().filter(|t| !t.is_empty()) {
            info!("Authenticating with GitHub token");
            return Ok(Self::Token(Token::from(token)));
        }

        match (
            config.app_id,
            config.app_installation_id,
            config.app_private_key.as_deref(),
        ) {
            (Some(app_id), Some(installation_id), Some(private_key)) if !private_key.is_empty() => {
                info!("Authenticating with GitHub App {app_id} (installation {installation_id})");
                let pem = if private_key.trim_start().starts_with("-----BEGIN") {
                    private_key.to_string()
                } else {
                    std::fs::read_to_string(private_key).map_err(|e| {
                        ExporterError::Config(format!(
                            "Failed to read GitHub App private key {private_key}: {e}"
                        ))
                    })?
                };
                let key = EncodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| {
                    ExporterError::Config(format!("Invalid GitHub App private key: {e}"))
                })?;

                Ok(Self::App(AppCredentials {
                    app_id,
                    installation_id,
                    key,
                }))
            }
            _ => {
                warn!("No GitHub token or App credentials provided, using unauthenticated client (limited rate)");
                Ok(Self::Anonymous)
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Debug, Clone, Deserialize)]
struct InstallationToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl InstallationToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - Duration::seconds(TOKEN_RENEWAL_MARGIN_SECONDS) > now
    }
}

/// Resolves the bearer token for each request.
///
/// Installation tokens are kept in an atomically swapped slot; a renewal
/// happens outside any lock and simply replaces the slot.
pub struct Authenticator {
    credentials: Credentials,
    installation_token: ArcSwapOption<InstallationToken>,
}

impl Authenticator {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            installation_token: ArcSwapOption::empty(),
        }
    }

    /// Returns the bearer token to attach to the next request, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if a GitHub App installation token cannot be obtained.
    pub async fn bearer(&self, http: &reqwest::Client, api_url: &Url) -> Result<Option<Token>> {
        match &self.credentials {
            Credentials::Token(token) => Ok(Some(token.clone())),
            Credentials::Anonymous => Ok(None),
            Credentials::App(app) => {
                let now = Utc::now();
                if let Some(cached) = self.installation_token.load_full() {
                    if cached.is_fresh(now) {
                        return Ok(Some(Token::from(cached.token.as_str())));
                    }
                }

                let fresh = request_installation_token(http, api_url, app).await?;
                let token = Token::from(fresh.token.as_str());
                self.installation_token.store(Some(Arc::new(fresh)));
                Ok(Some(token))
            }
        }
    }
}

fn app_jwt(app: &AppCredentials, now: DateTime<Utc>) -> Result<String> {
    let claims = AppClaims {
        iat: (now - Duration::seconds(60)).timestamp(),
        exp: (now + Duration::minutes(9)).timestamp(),
        iss: app.app_id.to_string(),
    };

    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &app.key)
        .map_err(|e| ExporterError::Auth(format!("Failed to sign GitHub App JWT: {e}")))
}

async fn request_installation_token(
    http: &reqwest::Client,
    api_url: &Url,
    app: &AppCredentials,
) -> Result<InstallationToken> {
    let url = api_url
        .join(&format!(
            "app/installations/{}/access_tokens",
            app.installation_id
        ))
        .map_err(|e| ExporterError::Config(format!("Invalid installation token URL: {e}")))?;

    let jwt = app_jwt(app, Utc::now())?;
    let response = http.post(url).bearer_auth(jwt).send().await?;

    let status = response.status();
    if !status.is_success() {
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read error response".to_string());
        return Err(ExporterError::Auth(format!(
            "Installation token request failed (status {status}): {message}"
        )));
    }

    let token: InstallationToken = response.json().await?;
    debug!("Obtained installation token valid until {}", token.expires_at);
    Ok(token)
}

//! OAuth credential lifecycle for calendar providers.
//!
//! Per `(user, provider)`: a valid token is used as-is; a token at or near expiry with a
//! refresh token is refreshed and the result persisted before use. A failed refresh is
//! logged and the stale token handed back, so the provider call that follows fails with
//! an authorization error that surfaces as a sync failure.

use chrono::{Duration, NaiveDateTime, Utc};
use serde::Deserialize;
use sqlx::SqlitePool;

use crate::config::GoogleConfig;
use crate::db::models::{OAuthIntegration, OAuthProvider};
use crate::db::OAuthIntegrationRepository;
use crate::error::{AppError, AppResult};
use crate::services::resilience::ResilientClient;

/// Tokens expiring within this margin are refreshed ahead of use.
const EXPIRY_MARGIN_SECONDS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Valid,
    /// Expired (or about to) and a refresh token is available.
    RefreshDue,
    /// Expired with nothing to refresh with.
    Expired,
}

pub fn token_state(integration: &OAuthIntegration, now: NaiveDateTime) -> TokenState {
    if integration.expires_at > now + Duration::seconds(EXPIRY_MARGIN_SECONDS) {
        return TokenState::Valid;
    }
    match integration.refresh_token.as_deref() {
        Some(token) if !token.trim().is_empty() => TokenState::RefreshDue,
        _ => TokenState::Expired,
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Clone)]
pub struct OAuthTokenManager {
    google: GoogleConfig,
    http: ResilientClient,
}

impl OAuthTokenManager {
    pub fn new(google: GoogleConfig, http: ResilientClient) -> Self {
        Self { google, http }
    }

    /// An access token for `user_id` at `provider`, refreshed first when due.
    pub async fn access_token(
        &self,
        pool: &SqlitePool,
        user_id: &str,
        provider: OAuthProvider,
    ) -> AppResult<String> {
        let integration =
            OAuthIntegrationRepository::find_by_user_and_provider(pool, user_id, provider)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!(
                        "No {} integration connected for this user",
                        provider.as_str()
                    ))
                })?;

        match token_state(&integration, Utc::now().naive_utc()) {
            TokenState::Valid => Ok(integration.access_token),
            TokenState::Expired => {
                tracing::warn!(
                    "{} token for user {} expired and has no refresh token",
                    provider.as_str(),
                    user_id
                );
                Ok(integration.access_token)
            }
            TokenState::RefreshDue => {
                let refresh_token = integration.refresh_token.as_deref().unwrap_or_default();
                match self.refresh(provider, refresh_token).await {
                    Ok(refreshed) => {
                        let expires_at =
                            Utc::now().naive_utc() + Duration::seconds(refreshed.expires_in);
                        OAuthIntegrationRepository::update_tokens(
                            pool,
                            &integration.id,
                            &refreshed.access_token,
                            refreshed.refresh_token.as_deref(),
                            expires_at,
                        )
                        .await?;
                        tracing::info!(
                            "Refreshed {} token for user {}; expires at {}",
                            provider.as_str(),
                            user_id,
                            expires_at
                        );
                        Ok(refreshed.access_token)
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Failed to refresh {} token for user {}: {}; continuing with stored token",
                            provider.as_str(),
                            user_id,
                            e
                        );
                        Ok(integration.access_token)
                    }
                }
            }
        }
    }

    async fn refresh(&self, provider: OAuthProvider, refresh_token: &str) -> AppResult<TokenResponse> {
        let (client_id, client_secret, token_url) = match provider {
            OAuthProvider::Google => (
                self.google.client_id.as_deref(),
                self.google.client_secret.as_deref(),
                self.google.token_url.as_str(),
            ),
        };
        let (Some(client_id), Some(client_secret)) = (client_id, client_secret) else {
            return Err(AppError::Config(format!(
                "{} OAuth client credentials are not configured",
                provider.as_str()
            )));
        };

        let response = self
            .http
            .send(|client| {
                client.post(token_url).form(&[
                    ("client_id", client_id),
                    ("client_secret", client_secret),
                    ("refresh_token", refresh_token),
                    ("grant_type", "refresh_token"),
                ])
            })
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::OAuth(format!(
                "Token endpoint returned {}: {}",
                status, error_text
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| AppError::OAuth(format!("Failed to parse token response: {}", e)))
    }
}

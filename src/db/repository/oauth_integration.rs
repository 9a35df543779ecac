use chrono::{NaiveDateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::db::models::*;
use crate::error::{AppError, AppResult};

// ============================================================================
// OAuth Integration Repository
// ============================================================================

pub struct OAuthIntegrationRepository;

impl OAuthIntegrationRepository {
    pub async fn find_by_user_and_provider(
        pool: &SqlitePool,
        user_id: &str,
        provider: OAuthProvider,
    ) -> AppResult<Option<OAuthIntegration>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, provider, access_token, refresh_token,
                   expires_at, created_at, updated_at
            FROM oauth_integrations
            WHERE user_id = ? AND provider = ?
            "#,
        )
        .bind(user_id)
        .bind(provider.as_str())
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row.map(|r| OAuthIntegration {
            id: r.get("id"),
            user_id: r.get("user_id"),
            provider: r.get("provider"),
            access_token: r.get("access_token"),
            refresh_token: r.get("refresh_token"),
            expires_at: r.get("expires_at"),
            created_at: r.get("created_at"),
            updated_at: r.get("updated_at"),
        }))
    }

    /// Persist a refreshed credential. A `None` refresh token keeps the stored one.
    pub async fn update_tokens(
        pool: &SqlitePool,
        id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: NaiveDateTime,
    ) -> AppResult<()> {
        let now = Utc::now().naive_utc();

        sqlx::query(
            r#"
            UPDATE oauth_integrations
            SET access_token = ?,
                refresh_token = COALESCE(?, refresh_token),
                expires_at = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }
}

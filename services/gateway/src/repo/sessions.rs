use sqlx::PgPool;

/// Marks a session revoked, per §4.B. [`crate::auth::AuthVerifier`] checks
/// this table before trusting an otherwise-valid JWT at every verification
/// path; nothing purges old rows since a revoked session's own `exp` claim
/// already bounds how long the row needs to matter.
pub async fn revoke(pool: &PgPool, session_id: &str) -> sqlx::Result<()> {
    sqlx::query!(
        r#"INSERT INTO revoked_sessions (session_id, revoked_at)
           VALUES ($1, now())
           ON CONFLICT (session_id) DO NOTHING"#,
        session_id,
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn is_revoked(pool: &PgPool, session_id: &str) -> sqlx::Result<bool> {
    sqlx::query_scalar!(
        r#"SELECT EXISTS(SELECT 1 FROM revoked_sessions WHERE session_id = $1) AS "revoked!""#,
        session_id,
    )
    .fetch_one(pool)
    .await
}

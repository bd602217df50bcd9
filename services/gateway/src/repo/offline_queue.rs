use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

/// A persisted envelope addressed to a principal with no live subscribed
/// connection at publish time, per §4.I.
pub struct OfflineMessageRow {
    pub id: Uuid,
    pub envelope_json: serde_json::Value,
}

/// Persists one Offline Message, then trims the oldest undelivered rows
/// for this `(principalId, topic)` beyond `max_per_principal_topic` -- the
/// per-principal size cap left as configurable (§9 Open Questions).
pub async fn persist(
    pool: &PgPool,
    principal_id: &str,
    topic: &str,
    envelope_json: serde_json::Value,
    retention: chrono::Duration,
    max_per_principal_topic: i64,
) -> sqlx::Result<()> {
    let expires_at = Utc::now() + retention;
    sqlx::query!(
        r#"INSERT INTO offline_messages (principal_id, topic, envelope_json, created_at, expires_at)
           VALUES ($1, $2, $3, now(), $4)"#,
        principal_id,
        topic,
        envelope_json,
        expires_at,
    )
    .execute(pool)
    .await?;

    sqlx::query!(
        r#"DELETE FROM offline_messages
           WHERE id IN (
               SELECT id FROM offline_messages
               WHERE principal_id = $1 AND topic = $2 AND delivered_at IS NULL
               ORDER BY created_at DESC
               OFFSET $3
           )"#,
        principal_id,
        topic,
        max_per_principal_topic,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetches undelivered messages for `(principalId, topic)` in `createdAt`
/// order, for replay on a matching SUBSCRIBE.
pub async fn fetch_undelivered(
    pool: &PgPool,
    principal_id: &str,
    topic: &str,
) -> sqlx::Result<Vec<OfflineMessageRow>> {
    let rows = sqlx::query!(
        r#"SELECT id, envelope_json FROM offline_messages
           WHERE principal_id = $1 AND topic = $2 AND delivered_at IS NULL AND expires_at > now()
           ORDER BY created_at ASC"#,
        principal_id,
        topic,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| OfflineMessageRow {
            id: r.id,
            envelope_json: r.envelope_json,
        })
        .collect())
}

pub async fn mark_delivered(pool: &PgPool, id: Uuid) -> sqlx::Result<()> {
    sqlx::query!(
        "UPDATE offline_messages SET delivered_at = now() WHERE id = $1",
        id
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Deletes rows past `expires_at`. Run periodically by a background sweep
/// task started from `main.rs`.
pub async fn sweep_expired(pool: &PgPool) -> sqlx::Result<u64> {
    let result = sqlx::query!("DELETE FROM offline_messages WHERE expires_at <= now()")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

use sqlx::PgPool;
use uuid::Uuid;

/// Best-effort subscribe/unsubscribe audit trail, per §6's optional audit
/// log note. Never awaited on the hot path -- failures are logged and
/// swallowed, since losing an audit row must never affect delivery.
pub async fn record(
    pool: &PgPool,
    connection_id: Uuid,
    principal_id: Option<&str>,
    topic: &str,
    action: &str,
) {
    let result = sqlx::query!(
        r#"INSERT INTO subscription_audit (connection_id, principal_id, topic, action, at)
           VALUES ($1, $2, $3, $4, now())"#,
        connection_id,
        principal_id,
        topic,
        action,
    )
    .execute(pool)
    .await;

    if let Err(err) = result {
        tracing::warn!(%connection_id, topic, action, error = %err, "failed to record subscription audit row");
    }
}

use sqlx::PgPool;

/// Records that `(kind, source_id)` is being dispatched. Returns `false`
/// when another worker already claimed it.
pub async fn claim(pool: &PgPool, kind: &str, source_id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO page_update_dispatch (kind, source_id)
        VALUES ($1, $2)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(kind)
    .bind(source_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Drops a claim so the job can be retried after a failed load.
pub async fn release(pool: &PgPool, kind: &str, source_id: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM page_update_dispatch WHERE kind = $1 AND source_id = $2")
        .bind(kind)
        .bind(source_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

use crate::models::ComponentRow;
use sqlx::PgPool;

/// Existing components among `ids`, whichever page they belong to.
pub async fn list_by_ids(pool: &PgPool, ids: &[i64]) -> Result<Vec<ComponentRow>, sqlx::Error> {
    sqlx::query_as::<_, ComponentRow>(
        r#"
        SELECT id, page_id, name
        FROM page_component
        WHERE id = ANY($1)
        ORDER BY id
        "#,
    )
    .bind(ids)
    .fetch_all(pool)
    .await
}

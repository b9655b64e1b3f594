use crate::models::PageRow;
use sqlx::PgPool;

pub async fn get_by_id(pool: &PgPool, id: i64) -> Result<Option<PageRow>, sqlx::Error> {
    sqlx::query_as::<_, PageRow>(
        r#"
        SELECT id, workspace_id, title, slug, custom_domain
        FROM page
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

use crate::models::UpdateRow;
use sqlx::PgPool;

/// A maintenance window shaped as an update. The status is always
/// `maintenance` and the window start is the update date.
pub async fn get_update(pool: &PgPool, id: i64) -> Result<Option<UpdateRow>, sqlx::Error> {
    sqlx::query_as::<_, UpdateRow>(
        r#"
        SELECT m.id, m.page_id, m.title, 'maintenance' AS status, m.message,
               m."from" AS date,
               COALESCE(array_agg(pc.id ORDER BY pc.id) FILTER (WHERE pc.id IS NOT NULL), '{}')
                   AS component_ids,
               COALESCE(array_agg(pc.name ORDER BY pc.id) FILTER (WHERE pc.id IS NOT NULL), '{}')
                   AS component_names
        FROM maintenance m
        LEFT JOIN maintenance_to_page_component mc ON mc.maintenance_id = m.id
        LEFT JOIN page_component pc ON pc.id = mc.page_component_id
        WHERE m.id = $1
        GROUP BY m.id
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

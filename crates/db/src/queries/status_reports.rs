use crate::models::UpdateRow;
use sqlx::PgPool;

/// One status report update with the parent report's page, title and
/// affected components.
pub async fn get_update(pool: &PgPool, id: i64) -> Result<Option<UpdateRow>, sqlx::Error> {
    sqlx::query_as::<_, UpdateRow>(
        r#"
        SELECT u.id, r.page_id, r.title, u.status, u.message, u.date,
               COALESCE(array_agg(pc.id ORDER BY pc.id) FILTER (WHERE pc.id IS NOT NULL), '{}')
                   AS component_ids,
               COALESCE(array_agg(pc.name ORDER BY pc.id) FILTER (WHERE pc.id IS NOT NULL), '{}')
                   AS component_names
        FROM status_report_update u
        JOIN status_report r ON r.id = u.status_report_id
        LEFT JOIN status_report_to_page_component rc ON rc.status_report_id = r.id
        LEFT JOIN page_component pc ON pc.id = rc.page_component_id
        WHERE u.id = $1
        GROUP BY u.id, r.id
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

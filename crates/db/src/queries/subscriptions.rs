use chrono::{DateTime, Utc};
use sqlx::PgExecutor;

use crate::models::SubscriptionRow;

/// Subscription columns plus the aggregated scope, filtered by `$filter`.
macro_rules! select_subscription {
    ($filter:literal) => {
        select_subscription!($filter, "")
    };
    ($filter:literal, $tail:literal) => {
        concat!(
            r#"
            SELECT s.id, s.page_id, s.workspace_id, s.channel_type, s.email,
                   s.webhook_url, s.channel_config, s.token, s.expires_at,
                   s.verified_at, s.unsubscribed_at,
                   COALESCE(
                       array_agg(c.page_component_id ORDER BY c.page_component_id)
                           FILTER (WHERE c.page_component_id IS NOT NULL),
                       '{}'
                   ) AS component_ids,
                   s.created_at, s.updated_at
            FROM page_subscription s
            LEFT JOIN page_subscription_component c ON c.page_subscription_id = s.id
            "#,
            $filter,
            "\nGROUP BY s.id\n",
            $tail
        )
    };
}

pub async fn get_by_id(
    executor: impl PgExecutor<'_>,
    id: i64,
) -> Result<Option<SubscriptionRow>, sqlx::Error> {
    sqlx::query_as::<_, SubscriptionRow>(select_subscription!("WHERE s.id = $1"))
        .bind(id)
        .fetch_optional(executor)
        .await
}

pub async fn get_by_token(
    executor: impl PgExecutor<'_>,
    token: &str,
) -> Result<Option<SubscriptionRow>, sqlx::Error> {
    sqlx::query_as::<_, SubscriptionRow>(select_subscription!("WHERE s.token = $1"))
        .bind(token)
        .fetch_optional(executor)
        .await
}

pub async fn list_eligible_for_page(
    executor: impl PgExecutor<'_>,
    page_id: i64,
) -> Result<Vec<SubscriptionRow>, sqlx::Error> {
    sqlx::query_as::<_, SubscriptionRow>(select_subscription!(
        "WHERE s.page_id = $1 AND s.verified_at IS NOT NULL AND s.unsubscribed_at IS NULL",
        "ORDER BY s.id"
    ))
    .bind(page_id)
    .fetch_all(executor)
    .await
}

pub async fn list_for_page(
    executor: impl PgExecutor<'_>,
    page_id: i64,
) -> Result<Vec<SubscriptionRow>, sqlx::Error> {
    sqlx::query_as::<_, SubscriptionRow>(select_subscription!(
        "WHERE s.page_id = $1",
        "ORDER BY s.created_at DESC, s.id DESC"
    ))
    .bind(page_id)
    .fetch_all(executor)
    .await
}

/// Row-locks the email subscription for `(page_id, email)` until the
/// surrounding transaction ends.
pub async fn lock_email(
    executor: impl PgExecutor<'_>,
    page_id: i64,
    email: &str,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r#"
        SELECT id
        FROM page_subscription
        WHERE page_id = $1 AND channel_type = 'email' AND lower(email) = lower($2)
        FOR UPDATE
        "#,
    )
    .bind(page_id)
    .bind(email)
    .fetch_optional(executor)
    .await
}

/// Row-locks the webhook subscription for `(page_id, url)` until the
/// surrounding transaction ends.
pub async fn lock_webhook(
    executor: impl PgExecutor<'_>,
    page_id: i64,
    url: &str,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r#"
        SELECT id
        FROM page_subscription
        WHERE page_id = $1 AND channel_type = 'webhook' AND webhook_url = $2
        FOR UPDATE
        "#,
    )
    .bind(page_id)
    .bind(url)
    .fetch_optional(executor)
    .await
}

#[allow(clippy::too_many_arguments)]
pub async fn insert(
    executor: impl PgExecutor<'_>,
    page_id: i64,
    workspace_id: Option<i64>,
    channel_type: &str,
    email: Option<&str>,
    webhook_url: Option<&str>,
    channel_config: Option<serde_json::Value>,
    token: &str,
    expires_at: DateTime<Utc>,
    verified_at: Option<DateTime<Utc>>,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO page_subscription
            (page_id, workspace_id, channel_type, email, webhook_url,
             channel_config, token, expires_at, verified_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING id
        "#,
    )
    .bind(page_id)
    .bind(workspace_id)
    .bind(channel_type)
    .bind(email)
    .bind(webhook_url)
    .bind(channel_config)
    .bind(token)
    .bind(expires_at)
    .bind(verified_at)
    .fetch_one(executor)
    .await
}

pub async fn insert_components(
    executor: impl PgExecutor<'_>,
    subscription_id: i64,
    component_ids: &[i64],
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO page_subscription_component (page_subscription_id, page_component_id)
        SELECT $1, component_id FROM unnest($2::bigint[]) AS component_id
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(subscription_id)
    .bind(component_ids)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

pub async fn delete_components(
    executor: impl PgExecutor<'_>,
    subscription_id: i64,
) -> Result<u64, sqlx::Error> {
    let result =
        sqlx::query("DELETE FROM page_subscription_component WHERE page_subscription_id = $1")
            .bind(subscription_id)
            .execute(executor)
            .await?;

    Ok(result.rows_affected())
}

pub async fn reactivate(
    executor: impl PgExecutor<'_>,
    id: i64,
    token: &str,
    expires_at: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE page_subscription
        SET token = $2, expires_at = $3, verified_at = NULL,
            unsubscribed_at = NULL, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(token)
    .bind(expires_at)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

pub async fn refresh_webhook(
    executor: impl PgExecutor<'_>,
    id: i64,
    channel_config: serde_json::Value,
    at: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE page_subscription
        SET channel_config = $2, verified_at = COALESCE(verified_at, $3),
            unsubscribed_at = NULL, updated_at = now()
        WHERE id = $1 AND channel_type = 'webhook'
        "#,
    )
    .bind(id)
    .bind(channel_config)
    .bind(at)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

pub async fn extend_expiry(
    executor: impl PgExecutor<'_>,
    id: i64,
    expires_at: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE page_subscription SET expires_at = $2, updated_at = now() WHERE id = $1",
    )
    .bind(id)
    .bind(expires_at)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

pub async fn touch(executor: impl PgExecutor<'_>, id: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE page_subscription SET updated_at = now() WHERE id = $1")
        .bind(id)
        .execute(executor)
        .await?;

    Ok(result.rows_affected())
}

pub async fn mark_verified(
    executor: impl PgExecutor<'_>,
    id: i64,
    at: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE page_subscription
        SET verified_at = $2, updated_at = $2
        WHERE id = $1 AND verified_at IS NULL
        "#,
    )
    .bind(id)
    .bind(at)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

pub async fn mark_unsubscribed(
    executor: impl PgExecutor<'_>,
    id: i64,
    at: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE page_subscription
        SET unsubscribed_at = $2, updated_at = $2
        WHERE id = $1 AND unsubscribed_at IS NULL
        "#,
    )
    .bind(id)
    .bind(at)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

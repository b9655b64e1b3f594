use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use statuscast_core::types::{ChannelType, Subscription, SubscriptionSummary};
use tracing::warn;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/pages/{page_id}/subscribe", post(subscribe))
        .route("/v1/subscriptions/{token}", get(get_subscription))
        .route("/v1/subscriptions/{token}/verify", post(verify))
        .route("/v1/subscriptions/{token}/components", put(update_components))
        .route("/v1/subscriptions/{token}/unsubscribe", post(unsubscribe))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeRequest {
    email: String,
    #[serde(default)]
    component_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateComponentsRequest {
    component_ids: Vec<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct DomainQuery {
    domain: Option<String>,
}

impl DomainQuery {
    fn domain(&self) -> Option<&str> {
        self.domain.as_deref().filter(|domain| !domain.is_empty())
    }
}

async fn subscribe(
    State(state): State<AppState>,
    Path(page_id): Path<i64>,
    Json(payload): Json<SubscribeRequest>,
) -> ApiResult<Json<SubscriptionSummary>> {
    let subscription = state
        .service
        .upsert_email_subscription(&payload.email, page_id, &payload.component_ids)
        .await?;
    let page = state.service.get_page(page_id).await?;

    if subscription.verified_at.is_none() {
        let verify_url = page.verify_url(&state.settings.page_base_domain, &subscription.token);
        if let Err(err) = state
            .channels
            .get(ChannelType::Email)
            .send_verification(&subscription, &page, &verify_url)
            .await
        {
            // the row is committed; subscribing again resends the link
            warn!(
                subscription_id = subscription.id,
                page_id,
                error = %err,
                "verification email failed"
            );
        }
    }

    Ok(Json(subscription.summary(Some(&page))))
}

async fn verify(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(query): Query<DomainQuery>,
) -> ApiResult<Json<SubscriptionSummary>> {
    let subscription = state
        .service
        .verify_subscription(&token, query.domain())
        .await?
        .ok_or_else(|| ApiError::NotFound("Subscription not found".to_string()))?;

    Ok(summarize(&state, subscription).await)
}

async fn get_subscription(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(query): Query<DomainQuery>,
) -> ApiResult<Json<SubscriptionSummary>> {
    state
        .service
        .get_subscription_by_token(&token, query.domain())
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Subscription not found".to_string()))
}

async fn update_components(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(query): Query<DomainQuery>,
    Json(payload): Json<UpdateComponentsRequest>,
) -> ApiResult<Json<SubscriptionSummary>> {
    let subscription = state
        .service
        .update_subscription_scope(&token, &payload.component_ids, query.domain())
        .await?;

    Ok(summarize(&state, subscription).await)
}

async fn unsubscribe(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(query): Query<DomainQuery>,
) -> ApiResult<StatusCode> {
    state.service.unsubscribe(&token, query.domain()).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// The page fields are dropped from the summary when the page cannot be read.
async fn summarize(state: &AppState, subscription: Subscription) -> Json<SubscriptionSummary> {
    let page = match state.service.get_page(subscription.page_id).await {
        Ok(page) => Some(page),
        Err(err) => {
            warn!(
                subscription_id = subscription.id,
                page_id = subscription.page_id,
                error = %err,
                "page lookup failed, summarizing without page"
            );
            None
        }
    };
    Json(subscription.summary(page.as_ref()))
}

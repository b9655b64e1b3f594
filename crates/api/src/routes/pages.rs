use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use statuscast_core::types::{SubscriptionSummary, WebhookConfig, WebhookHeader};

use crate::{error::ApiResult, state::AppState};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/pages/{page_id}/webhooks", post(create_webhook))
        .route("/v1/pages/{page_id}/subscriptions", get(list_subscriptions))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateWebhookRequest {
    url: String,
    #[serde(default)]
    headers: Vec<WebhookHeader>,
    secret: Option<String>,
    #[serde(default)]
    component_ids: Vec<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateWebhookResponse {
    #[serde(flatten)]
    subscription: SubscriptionSummary,
    /// Management token for the owner.
    token: String,
}

#[derive(Debug, Serialize)]
struct SubscriptionListResponse {
    items: Vec<SubscriptionSummary>,
}

async fn create_webhook(
    State(state): State<AppState>,
    Path(page_id): Path<i64>,
    Json(payload): Json<CreateWebhookRequest>,
) -> ApiResult<(StatusCode, Json<CreateWebhookResponse>)> {
    let config = WebhookConfig {
        headers: payload.headers,
        secret: payload.secret,
    };
    let subscription = state
        .service
        .create_webhook_subscription(page_id, &payload.url, config, &payload.component_ids)
        .await?;
    let page = state.service.get_page(page_id).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateWebhookResponse {
            token: subscription.token.clone(),
            subscription: subscription.summary(Some(&page)),
        }),
    ))
}

async fn list_subscriptions(
    State(state): State<AppState>,
    Path(page_id): Path<i64>,
) -> ApiResult<Json<SubscriptionListResponse>> {
    let items = state.service.list_page_subscriptions(page_id).await?;
    Ok(Json(SubscriptionListResponse { items }))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;

    use crate::routes::testing::{json_request, TestApp, ADMIN_TOKEN};

    fn authorized(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        let mut req = json_request(method, uri, body);
        req.headers_mut().insert(
            "authorization",
            format!("Bearer {}", ADMIN_TOKEN).parse().unwrap(),
        );
        req
    }

    #[tokio::test]
    async fn test_admin_routes_require_token() {
        let app = TestApp::new().await;

        let (status, body) = app
            .send(json_request("GET", "/v1/pages/1/subscriptions", json!(null)))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "unauthorized");

        let mut wrong = json_request("GET", "/v1/pages/1/subscriptions", json!(null));
        wrong
            .headers_mut()
            .insert("authorization", "Bearer nope".parse().unwrap());
        let (status, _) = app.send(wrong).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_create_webhook_is_active_immediately() {
        let app = TestApp::new().await;

        let (status, body) = app
            .send(authorized(
                "POST",
                "/v1/pages/1/webhooks",
                json!({
                    "url": "https://hooks.acme.dev/status",
                    "headers": [{"key": "Authorization", "value": "Bearer x"}],
                    "secret": "whsec",
                    "componentIds": [11]
                }),
            ))
            .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["channelType"], "webhook");
        assert_eq!(body["state"], "active");
        assert_eq!(body["webhookUrl"], "https://hooks.acme.dev/status");
        assert_eq!(body["token"].as_str().unwrap().len(), 32);
        assert!(body.get("secret").is_none());
    }

    #[tokio::test]
    async fn test_create_same_webhook_twice_lists_one_row() {
        let app = TestApp::new().await;
        let create = |components: serde_json::Value| {
            authorized(
                "POST",
                "/v1/pages/1/webhooks",
                json!({"url": "https://hooks.acme.dev/status", "componentIds": components}),
            )
        };

        let (_, first) = app.send(create(json!([10]))).await;
        let (status, second) = app.send(create(json!([11]))).await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(second["id"], first["id"]);
        assert_eq!(second["componentIds"], json!([10, 11]));

        let (_, listed) = app
            .send(authorized("GET", "/v1/pages/1/subscriptions", json!(null)))
            .await;
        assert_eq!(listed["items"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_webhook_rejects_reserved_header() {
        let app = TestApp::new().await;

        let (status, body) = app
            .send(authorized(
                "POST",
                "/v1/pages/1/webhooks",
                json!({
                    "url": "https://hooks.acme.dev/status",
                    "headers": [{"key": "Content-Type", "value": "text/plain"}]
                }),
            ))
            .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "invalid_request");
    }

    #[tokio::test]
    async fn test_list_subscriptions_masks_emails() {
        let app = TestApp::new().await;
        app.send(json_request(
            "POST",
            "/v1/pages/1/subscribe",
            json!({"email": "jane@acme.dev"}),
        ))
        .await;

        let (status, body) = app
            .send(authorized("GET", "/v1/pages/1/subscriptions", json!(null)))
            .await;

        assert_eq!(status, StatusCode::OK);
        let items = body["items"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["email"], "j***@acme.dev");
    }
}

pub mod health;
pub mod pages;
pub mod subscriptions;

use axum::{
    middleware::{from_fn, from_fn_with_state},
    Router,
};

use crate::middleware::{auth::admin_auth, rate_limit::rate_limit, request_id::request_id};
use crate::state::AppState;

pub fn app(state: AppState) -> Router {
    let public = subscriptions::router(state.clone())
        .route_layer(from_fn_with_state(state.clone(), rate_limit));
    let admin = pages::router(state.clone()).route_layer(from_fn_with_state(state, admin_auth));

    Router::new()
        .merge(health::router())
        .merge(public)
        .merge(admin)
        .layer(from_fn(request_id))
}

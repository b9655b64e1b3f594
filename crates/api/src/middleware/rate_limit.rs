use std::net::{IpAddr, SocketAddr};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::{error::ApiError, state::AppState};

const TOKEN_BUCKET: &str = r#"
local bucket = KEYS[1]
local now = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local refill = tonumber(ARGV[3])

local data = redis.call('HMGET', bucket, 'tokens', 'ts')
local tokens = tonumber(data[1]) or capacity
local ts = tonumber(data[2]) or now

local delta = math.max(0, now - ts)
local new_tokens = math.min(capacity, tokens + (delta * refill / 60))

if new_tokens < 1 then
  redis.call('HMSET', bucket, 'tokens', new_tokens, 'ts', now)
  redis.call('EXPIRE', bucket, 120)
  return 0
else
  new_tokens = new_tokens - 1
  redis.call('HMSET', bucket, 'tokens', new_tokens, 'ts', now)
  redis.call('EXPIRE', bucket, 120)
  return 1
end
"#;

/// Per-client-IP token bucket for the public routes. Skipped without Redis;
/// Redis failures let the request through.
pub async fn rate_limit(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(redis) = state.redis.as_ref() else {
        return Ok(next.run(req).await);
    };

    let ip = client_ip(&req, &state.settings.trusted_proxies);
    let capacity = state.settings.rate_limit_subscribe;

    let allowed = match redis.get_multiplexed_async_connection().await {
        Ok(mut conn) => allow_request(&mut conn, &ip, capacity, capacity).await,
        Err(err) => Err(err),
    };

    match allowed {
        Ok(true) => Ok(next.run(req).await),
        Ok(false) => Err(ApiError::RateLimited),
        Err(err) => {
            warn!(error = %err, "rate limiter unavailable, allowing request");
            Ok(next.run(req).await)
        }
    }
}

/// The peer address, unless the peer is a trusted proxy. Then the
/// `X-Forwarded-For` chain is walked from the right and the first hop that is
/// not itself a trusted proxy wins.
fn client_ip(req: &Request<Body>, trusted: &[IpAddr]) -> String {
    let Some(peer) = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
    else {
        return "unknown".to_string();
    };
    if !trusted.contains(&peer) {
        return peer.to_string();
    }

    let hops: Vec<IpAddr> = req
        .headers()
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|hop| hop.trim().parse().ok())
        .collect();

    hops.iter()
        .rev()
        .find(|hop| !trusted.contains(*hop))
        .or_else(|| hops.first())
        .unwrap_or(&peer)
        .to_string()
}

async fn allow_request(
    conn: &mut redis::aio::MultiplexedConnection,
    ip: &str,
    capacity: u32,
    refill_per_min: u32,
) -> redis::RedisResult<bool> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();

    let allowed: i32 = redis::Script::new(TOKEN_BUCKET)
        .key(format!("rl:subscribe:{}", ip))
        .arg(now)
        .arg(capacity)
        .arg(refill_per_min)
        .invoke_async(conn)
        .await?;

    Ok(allowed == 1)
}

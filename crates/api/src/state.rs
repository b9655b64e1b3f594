use std::sync::Arc;

use redis::Client as RedisClient;
use statuscast_channels::ChannelRegistry;
use statuscast_core::config::Settings;
use statuscast_core::SubscriptionService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SubscriptionService>,
    pub channels: ChannelRegistry,
    pub settings: Arc<Settings>,
    /// Rate limiting is off when unset.
    pub redis: Option<RedisClient>,
}

#[derive(Debug, Clone)]
pub struct RequestId(pub String);

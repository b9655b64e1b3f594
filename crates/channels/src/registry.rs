use std::sync::Arc;

use statuscast_core::types::ChannelType;

use crate::Channel;

/// Maps every [`ChannelType`] to its implementation.
#[derive(Clone)]
pub struct ChannelRegistry {
    email: Arc<dyn Channel>,
    webhook: Arc<dyn Channel>,
}

impl ChannelRegistry {
    pub fn new(email: Arc<dyn Channel>, webhook: Arc<dyn Channel>) -> Self {
        Self { email, webhook }
    }

    pub fn get(&self, channel_type: ChannelType) -> &Arc<dyn Channel> {
        match channel_type {
            ChannelType::Email => &self.email,
            ChannelType::Webhook => &self.webhook,
        }
    }
}

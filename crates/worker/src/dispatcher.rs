//! Fan-out of page updates to matching subscriptions.
//!
//! Every entry point is best effort: failures are logged and summarised,
//! never returned as errors. Channel groups run concurrently and a failing
//! group does not affect the others.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use statuscast_channels::{ChannelRegistry, DeliveryReport};
use statuscast_core::scope;
use statuscast_core::store::{PageDirectory, SubscriptionStore, UpdateSource};
use statuscast_core::types::{ChannelType, PageUpdate, Subscription};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UpdateNotFound,
    PageNotFound,
    StoreUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutcome {
    Delivered(DeliveryReport),
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub skipped: Option<SkipReason>,
    /// Subscription ids that passed the eligibility and scope filters.
    pub matched: Vec<i64>,
    pub channels: BTreeMap<ChannelType, ChannelOutcome>,
}

impl DispatchSummary {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Default::default()
        }
    }
}

pub struct Dispatcher {
    subscriptions: Arc<dyn SubscriptionStore>,
    pages: Arc<dyn PageDirectory>,
    updates: Arc<dyn UpdateSource>,
    channels: ChannelRegistry,
}

impl Dispatcher {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        pages: Arc<dyn PageDirectory>,
        updates: Arc<dyn UpdateSource>,
        channels: ChannelRegistry,
    ) -> Self {
        Self {
            subscriptions,
            pages,
            updates,
            channels,
        }
    }

    pub async fn dispatch_status_report_update(
        &self,
        status_report_update_id: i64,
    ) -> DispatchSummary {
        match self
            .updates
            .status_report_update(status_report_update_id)
            .await
        {
            Ok(Some(update)) => self.dispatch_page_update(&update).await,
            Ok(None) => {
                warn!(
                    status_report_update_id,
                    "status report update not found, nothing to dispatch"
                );
                DispatchSummary::skipped(SkipReason::UpdateNotFound)
            }
            Err(err) => {
                error!(
                    status_report_update_id,
                    error = %err,
                    "failed to load status report update"
                );
                DispatchSummary::skipped(SkipReason::StoreUnavailable)
            }
        }
    }

    pub async fn dispatch_maintenance_update(&self, maintenance_id: i64) -> DispatchSummary {
        match self.updates.maintenance_update(maintenance_id).await {
            Ok(Some(update)) => self.dispatch_page_update(&update).await,
            Ok(None) => {
                warn!(maintenance_id, "maintenance not found, nothing to dispatch");
                DispatchSummary::skipped(SkipReason::UpdateNotFound)
            }
            Err(err) => {
                error!(maintenance_id, error = %err, "failed to load maintenance");
                DispatchSummary::skipped(SkipReason::StoreUnavailable)
            }
        }
    }

    pub async fn dispatch_page_update(&self, update: &PageUpdate) -> DispatchSummary {
        let page = match self.pages.get_page(update.page_id).await {
            Ok(Some(page)) => page,
            Ok(None) => {
                warn!(
                    page_id = update.page_id,
                    update_id = update.id,
                    "page not found, skipping dispatch"
                );
                return DispatchSummary::skipped(SkipReason::PageNotFound);
            }
            Err(err) => {
                error!(page_id = update.page_id, error = %err, "failed to load page");
                return DispatchSummary::skipped(SkipReason::StoreUnavailable);
            }
        };

        let subscriptions = match self.subscriptions.list_eligible_for_page(page.id).await {
            Ok(subscriptions) => subscriptions,
            Err(err) => {
                error!(page_id = page.id, error = %err, "failed to load subscriptions");
                return DispatchSummary::skipped(SkipReason::StoreUnavailable);
            }
        };

        let groups = group_matching(subscriptions, &update.page_component_ids);
        let mut summary = DispatchSummary {
            matched: groups.values().flatten().map(|sub| sub.id).collect(),
            ..Default::default()
        };

        if groups.is_empty() {
            info!(page_id = page.id, update_id = update.id, "no subscriptions match update");
            return summary;
        }

        let page = &page;
        let sends = groups.iter().map(|(&channel_type, group)| async move {
            let channel = self.channels.get(channel_type);
            let outcome = match channel.send_notifications(group, page, update).await {
                Ok(report) => ChannelOutcome::Delivered(report),
                Err(err) => {
                    error!(
                        channel = %channel_type,
                        page_id = page.id,
                        update_id = update.id,
                        error = %err,
                        "channel delivery failed"
                    );
                    ChannelOutcome::Failed(err.to_string())
                }
            };
            (channel_type, outcome)
        });
        summary.channels = join_all(sends).await.into_iter().collect();

        info!(
            page_id = page.id,
            update_id = update.id,
            matched = summary.matched.len(),
            "update dispatched"
        );
        summary
    }
}

/// Eligible subscriptions whose scope matches `affected`, grouped by channel.
fn group_matching(
    subscriptions: Vec<Subscription>,
    affected: &[i64],
) -> BTreeMap<ChannelType, Vec<Subscription>> {
    let mut groups: BTreeMap<ChannelType, Vec<Subscription>> = BTreeMap::new();
    for sub in subscriptions {
        if sub.is_eligible() && scope::matches_update(&sub.component_ids, affected) {
            groups.entry(sub.channel_type()).or_default().push(sub);
        }
    }
    groups
}

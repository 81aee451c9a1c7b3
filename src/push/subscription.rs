//! Per-connection subscription filter.

use std::collections::HashSet;

use crate::models::{MetricKind, ServerId, ServerStatus};

/// Severity ranking used for `min_status` filtering — independent of
/// [`ServerStatus`]'s derive order, which exists only for worst-band
/// aggregation in the threshold evaluator.
fn severity(status: ServerStatus) -> u8 {
    match status {
        ServerStatus::Unknown => 0,
        ServerStatus::Online => 1,
        ServerStatus::Warning => 2,
        ServerStatus::Critical => 3,
        ServerStatus::Offline => 3,
    }
}

/// What a connection wants to receive: either every server, or an explicit
/// set, optionally narrowed by metric kind and a minimum status floor. A
/// fresh connection subscribes to nothing until it asks.
#[derive(Debug, Clone, Default)]
pub struct Subscription {
    all: bool,
    servers: HashSet<ServerId>,
    metrics: Option<HashSet<MetricKind>>,
    min_status: Option<ServerStatus>,
}

impl Subscription {
    pub fn matches_server(&self, server_id: &ServerId) -> bool {
        self.all || self.servers.contains(server_id)
    }

    pub fn matches_status(&self, status: ServerStatus) -> bool {
        match self.min_status {
            Some(floor) => severity(status) >= severity(floor),
            None => true,
        }
    }

    /// `None` means "all metrics" — used as the fanout cache key.
    pub fn metrics_filter(&self) -> Option<&HashSet<MetricKind>> {
        self.metrics.as_ref()
    }

    pub fn replace_all(&mut self, metrics: Option<Vec<MetricKind>>, min_status: Option<ServerStatus>) {
        self.all = true;
        self.servers.clear();
        self.metrics = metrics.map(|m| m.into_iter().collect());
        self.min_status = min_status;
    }

    pub fn replace(&mut self, server_ids: Vec<ServerId>, metrics: Option<Vec<MetricKind>>, min_status: Option<ServerStatus>) {
        self.all = false;
        self.servers = server_ids.into_iter().collect();
        self.metrics = metrics.map(|m| m.into_iter().collect());
        self.min_status = min_status;
    }

    /// An empty `server_ids` clears the subscription entirely (spec
    /// §4.7.2); otherwise only the listed servers are removed.
    pub fn remove(&mut self, server_ids: &[ServerId]) {
        if server_ids.is_empty() {
            self.all = false;
            self.servers.clear();
        } else {
            for id in server_ids {
                self.servers.remove(id);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.all && self.servers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_subscription_matches_nothing() {
        let sub = Subscription::default();
        assert!(!sub.matches_server(&ServerId::from("srv-1")));
    }

    #[test]
    fn subscribe_all_matches_any_server() {
        let mut sub = Subscription::default();
        sub.replace_all(None, None);
        assert!(sub.matches_server(&ServerId::from("anything")));
    }

    #[test]
    fn explicit_subscribe_then_unsubscribe() {
        let mut sub = Subscription::default();
        sub.replace(vec![ServerId::from("srv-1"), ServerId::from("srv-2")], None, None);
        assert!(sub.matches_server(&ServerId::from("srv-1")));
        sub.remove(&[ServerId::from("srv-1")]);
        assert!(!sub.matches_server(&ServerId::from("srv-1")));
        assert!(sub.matches_server(&ServerId::from("srv-2")));
    }

    #[test]
    fn empty_unsubscribe_clears_everything() {
        let mut sub = Subscription::default();
        sub.replace_all(None, None);
        sub.remove(&[]);
        assert!(sub.is_empty());
    }

    #[test]
    fn metric_filter_narrows_delivered_kinds() {
        let mut sub = Subscription::default();
        sub.replace(vec![ServerId::from("srv-1")], Some(vec![MetricKind::Cpu]), None);
        let filter = sub.metrics_filter().unwrap();
        assert!(filter.contains(&MetricKind::Cpu));
        assert!(!filter.contains(&MetricKind::Memory));
    }

    #[test]
    fn min_status_filters_below_floor() {
        let mut sub = Subscription::default();
        sub.replace_all(None, Some(ServerStatus::Warning));
        assert!(!sub.matches_status(ServerStatus::Online));
        assert!(sub.matches_status(ServerStatus::Warning));
        assert!(sub.matches_status(ServerStatus::Critical));
    }
}

//! Broadcast bus the election runs on
//!
//! A bus delivers every payload published on a channel to all current
//! members of that channel, the publisher included. Membership is explicit:
//! a participant is counted towards the quorum from `join` until `leave`
//! (or until its connection goes away).
use async_trait::async_trait;
use baton_api::InstanceId;
use std::collections::BTreeSet;
use tokio::sync::watch;

use crate::participant::Membership;
use crate::Result;

mod local;
mod tcp;

pub use self::local::LocalBus;
pub use self::tcp::TcpBus;

#[async_trait]
pub trait Bus: Send + Sync + 'static {
    /// Become a member of `channel` and start receiving its payloads
    async fn join(&self, channel: &str, member: &InstanceId) -> Result<Subscription>;
    async fn leave(&self, channel: &str, member: &InstanceId) -> Result<()>;
    async fn publish(&self, channel: &str, payload: String) -> Result<()>;
}

/// A joined channel
pub struct Subscription {
    pub messages: flume::Receiver<String>,
    /// Current members of the channel, updated on every join/leave
    pub members: watch::Receiver<Members>,
}

/// Set of participants on a channel
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Members(BTreeSet<InstanceId>);

impl Members {
    pub fn iter(&self) -> impl Iterator<Item = &InstanceId> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<InstanceId> for Members {
    fn from_iter<T: IntoIterator<Item = InstanceId>>(iter: T) -> Self {
        Self(BTreeSet::from_iter(iter))
    }
}

impl Membership for Members {
    fn count(&self) -> usize {
        self.0.len()
    }

    fn contains(&self, id: &InstanceId) -> bool {
        self.0.contains(id)
    }
}

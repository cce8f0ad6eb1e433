use async_trait::async_trait;
use baton_api::InstanceId;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, trace};

use super::{Bus, Members, Subscription};
use crate::Result;

/// In-process bus
///
/// Cloning gives another handle to the same bus, so participants in one
/// process (or one test) can share it.
#[derive(Clone, Default)]
pub struct LocalBus {
    channels: Arc<Mutex<HashMap<String, LocalChannel>>>,
}

struct LocalChannel {
    subscribers: BTreeMap<InstanceId, flume::Sender<String>>,
    members_tx: watch::Sender<Members>,
}

impl LocalChannel {
    fn new() -> Self {
        Self {
            subscribers: BTreeMap::new(),
            members_tx: watch::channel(Members::default()).0,
        }
    }

    fn announce_members(&self) {
        let members = self.subscribers.keys().cloned().collect();
        self.members_tx.send_replace(members);
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current members of `channel`
    pub fn members(&self, channel: &str) -> Members {
        self.channels
            .lock()
            .expect("locking failed")
            .get(channel)
            .map(|c| c.members_tx.borrow().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn join(&self, channel: &str, member: &InstanceId) -> Result<Subscription> {
        let mut channels = self.channels.lock().expect("locking failed");
        let local = channels
            .entry(channel.to_owned())
            .or_insert_with(LocalChannel::new);

        let (tx, rx) = flume::unbounded();
        local.subscribers.insert(member.clone(), tx);
        local.announce_members();
        debug!(channel, %member, "Joined");

        Ok(Subscription {
            messages: rx,
            members: local.members_tx.subscribe(),
        })
    }

    async fn leave(&self, channel: &str, member: &InstanceId) -> Result<()> {
        let mut channels = self.channels.lock().expect("locking failed");
        if let Some(local) = channels.get_mut(channel) {
            if local.subscribers.remove(member).is_some() {
                local.announce_members();
                debug!(channel, %member, "Left");
            }
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        let mut channels = self.channels.lock().expect("locking failed");
        let Some(local) = channels.get_mut(channel) else {
            trace!(channel, "Publishing to a channel with no members");
            return Ok(());
        };

        let before = local.subscribers.len();
        // a dropped receiver means the participant is gone without leaving
        local
            .subscribers
            .retain(|_, tx| tx.send(payload.clone()).is_ok());
        if local.subscribers.len() != before {
            local.announce_members();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participant::Membership;

    #[tokio::test]
    async fn delivers_to_all_members_including_sender() -> anyhow::Result<()> {
        let bus = LocalBus::new();
        let a = bus.join("ch", &InstanceId::from("A")).await?;
        let b = bus.join("ch", &InstanceId::from("B")).await?;

        bus.publish("ch", "hello".into()).await?;

        assert_eq!(a.messages.recv_async().await?, "hello");
        assert_eq!(b.messages.recv_async().await?, "hello");
        assert_eq!(a.members.borrow().count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn membership_follows_join_and_leave() -> anyhow::Result<()> {
        let bus = LocalBus::new();
        let a_id = InstanceId::from("A");
        let b_id = InstanceId::from("B");
        let a = bus.join("ch", &a_id).await?;
        let b = bus.join("ch", &b_id).await?;
        assert!(a.members.borrow().contains(&b_id));

        bus.leave("ch", &b_id).await?;
        assert!(!a.members.borrow().contains(&b_id));
        assert!(b.messages.recv_async().await.is_err());

        drop(a);
        bus.publish("ch", "anyone?".into()).await?;
        assert!(bus.members("ch").is_empty());
        Ok(())
    }
}

mod request_handler;

use crate::node::request_handler::RequestHandler;
use crate::task::PanicGuard;
use baton_api::{Frame, FrameCmd, FrameError, InstanceId};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace, warn};
use typed_builder::TypedBuilder;

/// Some parameters of runtime operation
#[derive(TypedBuilder, Debug, Clone)]
pub struct Parameters {
    #[builder(default = Parameters::DEFAULT_BIND_ADDR)]
    pub bind: SocketAddr,

    /// Frames queued for a connection before it is considered too slow
    /// and dropped
    #[builder(default = Parameters::DEFAULT_OUTBOUND_QUEUE_LEN)]
    pub outbound_queue_len: usize,
}

impl Parameters {
    pub const DEFAULT_BIND_ADDR: SocketAddr =
        SocketAddr::new(std::net::IpAddr::V6(Ipv6Addr::LOCALHOST), 0);
    pub const DEFAULT_OUTBOUND_QUEUE_LEN: usize = 1024;
}

pub type ConnectionId = u64;

/// Encoded frame, shared between all the connections it goes out to
pub type OutboundFrame = Arc<Vec<u8>>;

/// Who is subscribed to what
///
/// All changes and broadcasts go through one lock, so every connection
/// sees membership updates and deliveries of a topic in the same order.
#[derive(Default)]
pub(crate) struct Registry {
    next_connection_id: ConnectionId,
    connections: HashMap<ConnectionId, flume::Sender<OutboundFrame>>,
    /// Members of each topic and the connection they joined over
    topics: HashMap<String, BTreeMap<InstanceId, ConnectionId>>,
}

impl Registry {
    fn add_connection(&mut self, tx: flume::Sender<OutboundFrame>) -> ConnectionId {
        let conn_id = self.next_connection_id;
        self.next_connection_id += 1;
        self.connections.insert(conn_id, tx);
        conn_id
    }

    /// Queue `frame` to every connection with a member in `topic`
    ///
    /// Returns the connections whose queue is full.
    fn broadcast(&self, topic: &str, frame: &OutboundFrame) -> Vec<ConnectionId> {
        let Some(members) = self.topics.get(topic) else {
            return vec![];
        };
        // a connection with multiple members still gets one copy
        let conn_ids: BTreeSet<ConnectionId> = members.values().copied().collect();

        let mut slow = vec![];
        for conn_id in conn_ids {
            let Some(tx) = self.connections.get(&conn_id) else {
                continue;
            };
            match tx.try_send(Arc::clone(frame)) {
                Ok(()) => {}
                Err(flume::TrySendError::Full(_)) => slow.push(conn_id),
                // writer is gone, the connection is being torn down
                Err(flume::TrySendError::Disconnected(_)) => {}
            }
        }
        slow
    }

    fn announce_members(&self, topic: &str) -> Vec<ConnectionId> {
        let Some(members) = self.topics.get(topic) else {
            return vec![];
        };
        match Frame::members(topic, members.keys()).encode() {
            Ok(buf) => {
                trace!(topic, count = members.len(), "Announcing members");
                self.broadcast(topic, &Arc::new(buf))
            }
            Err(e) => {
                warn!(topic, error = %e, "Could not encode members");
                vec![]
            }
        }
    }

    fn join(&mut self, topic: &str, member: InstanceId, conn_id: ConnectionId) -> Vec<ConnectionId> {
        // dropped already, its reader just hasn't noticed yet
        if !self.connections.contains_key(&conn_id) {
            debug!(topic, %member, conn_id, "Ignoring join over a dropped connection");
            return vec![];
        }
        let members = self.topics.entry(topic.to_owned()).or_default();
        if let Some(prev) = members.insert(member.clone(), conn_id) {
            if prev != conn_id {
                warn!(topic, %member, prev, conn_id, "Member joined again over another connection");
            }
        }
        debug!(topic, %member, conn_id, "Join");
        self.announce_members(topic)
    }

    fn leave(&mut self, topic: &str, member: &InstanceId, conn_id: ConnectionId) -> Vec<ConnectionId> {
        let Some(members) = self.topics.get_mut(topic) else {
            return vec![];
        };
        if members.get(member) != Some(&conn_id) {
            debug!(topic, %member, conn_id, "Ignoring leave of a member we don't have");
            return vec![];
        }
        members.remove(member);
        debug!(topic, %member, conn_id, "Leave");
        if members.is_empty() {
            self.topics.remove(topic);
            return vec![];
        }
        self.announce_members(topic)
    }

    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        conn_id: ConnectionId,
    ) -> Result<Vec<ConnectionId>, FrameError> {
        if !self.connections.contains_key(&conn_id) {
            debug!(topic, conn_id, "Ignoring publish over a dropped connection");
            return Ok(vec![]);
        }
        let buf = Frame::new(FrameCmd::Deliver, topic, payload).encode()?;
        Ok(self.broadcast(topic, &Arc::new(buf)))
    }

    /// Forget the connection and all its members
    fn remove_connection(&mut self, conn_id: ConnectionId) -> Vec<ConnectionId> {
        if self.connections.remove(&conn_id).is_none() {
            return vec![];
        }

        let mut changed = vec![];
        self.topics.retain(|topic, members| {
            let before = members.len();
            members.retain(|_, c| *c != conn_id);
            if members.len() != before {
                changed.push(topic.clone());
            }
            !members.is_empty()
        });

        let mut slow = vec![];
        for topic in changed {
            slow.extend(self.announce_members(&topic));
        }
        slow
    }

    /// Disconnect connections that can't keep up
    ///
    /// Each removal is announced, which can find more slow connections.
    fn drop_slow(&mut self, mut slow: Vec<ConnectionId>) {
        while let Some(conn_id) = slow.pop() {
            if self.connections.contains_key(&conn_id) {
                warn!(conn_id, "Dropping connection that is not keeping up");
                slow.extend(self.remove_connection(conn_id));
            }
        }
    }

    #[cfg(test)]
    fn members(&self, topic: &str) -> Vec<InstanceId> {
        self.topics
            .get(topic)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }
}

pub struct NodeShared {
    params: Parameters,

    is_node_shutting_down: Arc<AtomicBool>,

    registry: Mutex<Registry>,
}

impl NodeShared {
    pub fn panic_guard(&self, name: &'static str) -> PanicGuard {
        PanicGuard::new(name, self.is_node_shutting_down.clone())
    }

    pub fn is_node_shutting_down(&self) -> bool {
        self.is_node_shutting_down.load(Ordering::SeqCst)
    }

    fn with_registry<R>(&self, f: impl FnOnce(&mut Registry) -> R) -> R {
        f(&mut self.registry.lock().expect("locking failed"))
    }

    pub fn add_connection(&self, tx: flume::Sender<OutboundFrame>) -> ConnectionId {
        self.with_registry(|r| r.add_connection(tx))
    }

    pub fn remove_connection(&self, conn_id: ConnectionId) {
        self.with_registry(|r| {
            let slow = r.remove_connection(conn_id);
            r.drop_slow(slow);
        })
    }

    pub fn join(&self, topic: &str, member: InstanceId, conn_id: ConnectionId) {
        self.with_registry(|r| {
            let slow = r.join(topic, member, conn_id);
            r.drop_slow(slow);
        })
    }

    pub fn leave(&self, topic: &str, member: &InstanceId, conn_id: ConnectionId) {
        self.with_registry(|r| {
            let slow = r.leave(topic, member, conn_id);
            r.drop_slow(slow);
        })
    }

    pub fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        conn_id: ConnectionId,
    ) -> Result<(), FrameError> {
        self.with_registry(|r| {
            let slow = r.publish(topic, payload, conn_id)?;
            r.drop_slow(slow);
            Ok(())
        })
    }
}

pub struct NodeCtrl {
    is_node_shutting_down: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

impl NodeCtrl {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&self) {
        self.is_node_shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn install_signal_handler(&self) -> anyhow::Result<()> {
        debug!("Installing signal handler");
        for sig in TERM_SIGNALS {
            trace!(sig, "Installing signal handler");
            flag::register(*sig, Arc::clone(&self.is_node_shutting_down))?;
        }
        Ok(())
    }
}

pub struct Node {
    is_node_shutting_down: Arc<AtomicBool>,
    stop_on_drop: bool,
    /// Tokio executor running the tcp connection handling
    request_handler: RequestHandler,
}

impl Drop for Node {
    fn drop(&mut self) {
        if self.stop_on_drop {
            self.is_node_shutting_down.store(true, Ordering::SeqCst);
        }
    }
}

impl Node {
    pub fn new(params: Parameters) -> anyhow::Result<Self> {
        info!(
            bind = %params.bind,
            outbound_queue_len = params.outbound_queue_len,
            "Starting batond"
        );

        let is_node_shutting_down = Arc::new(AtomicBool::new(false));

        let shared = Arc::new(NodeShared {
            is_node_shutting_down: is_node_shutting_down.clone(),
            params: params.clone(),
            registry: Mutex::new(Registry::default()),
        });

        let request_handler = RequestHandler::new(shared, params.bind)?;

        Ok(Node {
            stop_on_drop: true,
            request_handler,
            is_node_shutting_down,
        })
    }

    pub fn get_ctrl(&self) -> NodeCtrl {
        NodeCtrl {
            is_node_shutting_down: Arc::clone(&self.is_node_shutting_down),
            local_addr: self.request_handler.local_addr(),
        }
    }

    /// Block until the node was stopped
    pub fn wait(mut self) {
        self.stop_on_drop = false;
        drop(self);
        info!("Node finished");
    }
}

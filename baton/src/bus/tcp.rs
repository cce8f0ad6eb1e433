use async_trait::async_trait;
use baton_api::{read_frame, ConnectionHello, Frame, FrameCmd, InstanceId, BATOND_VERSION_0};
use binrw::BinRead;
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{Bus, Members, Subscription};
use crate::participant::Membership;
use crate::{Error, Result};

/// Bus client talking to a `batond`
///
/// One connection can carry any number of members, on the same channel too.
pub struct TcpBus {
    server_addr: SocketAddr,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    channels: Channels,
    reader: JoinHandle<()>,
}

/// Local subscribers, by channel and member
type Channels = Arc<Mutex<HashMap<String, BTreeMap<InstanceId, TcpChannel>>>>;

struct TcpChannel {
    messages_tx: flume::Sender<String>,
    members_tx: watch::Sender<Members>,
}

impl TcpBus {
    pub async fn connect(server_addr: SocketAddr) -> Result<Self> {
        debug!(?server_addr, "Connecting to batond");
        let mut conn = TcpStream::connect(server_addr).await?;
        trace!(?server_addr, "Connected");

        // frames are always written out whole
        conn.set_nodelay(true)?;

        let mut buf = [0u8; ConnectionHello::BYTE_SIZE];
        conn.read_exact(&mut buf).await?;
        let hello = ConnectionHello::read(&mut Cursor::new(&buf))?;

        if hello.version != BATOND_VERSION_0 {
            return Err(Error::ProtocolVersion(hello.version));
        }

        let (read_half, write_half) = conn.into_split();
        let channels: Channels = Arc::default();
        let reader = tokio::spawn(read_loop(read_half, Arc::clone(&channels)));

        Ok(Self {
            server_addr,
            writer: tokio::sync::Mutex::new(write_half),
            channels,
            reader,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        let buf = frame.encode()?;
        trace!(cmd = ?frame.cmd, topic = %frame.topic, len = buf.len(), "Sending frame");
        self.writer.lock().await.write_all(&buf).await?;
        Ok(())
    }
}

impl Drop for TcpBus {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl Bus for TcpBus {
    async fn join(&self, channel: &str, member: &InstanceId) -> Result<Subscription> {
        let (messages_tx, messages) = flume::unbounded();
        let (members_tx, mut members) = watch::channel(Members::default());
        self.channels
            .lock()
            .expect("locking failed")
            .entry(channel.to_owned())
            .or_default()
            .insert(
                member.clone(),
                TcpChannel {
                    messages_tx,
                    members_tx,
                },
            );

        self.send_frame(Frame::new(FrameCmd::Join, channel, member.as_str()))
            .await?;

        // Until the server counted us in, the quorum size would be wrong
        while !members.borrow_and_update().contains(member) {
            members.changed().await.map_err(|_| Error::Disconnected)?;
        }
        debug!(channel, %member, "Joined");

        Ok(Subscription { messages, members })
    }

    async fn leave(&self, channel: &str, member: &InstanceId) -> Result<()> {
        self.send_frame(Frame::new(FrameCmd::Leave, channel, member.as_str()))
            .await?;
        {
            let mut channels = self.channels.lock().expect("locking failed");
            if let Some(subscribers) = channels.get_mut(channel) {
                subscribers.remove(member);
                if subscribers.is_empty() {
                    channels.remove(channel);
                }
            }
        }
        debug!(channel, %member, "Left");
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        self.send_frame(Frame::new(FrameCmd::Publish, channel, payload))
            .await
    }
}

async fn read_loop(mut conn: OwnedReadHalf, channels: Channels) {
    loop {
        let frame = match read_frame(&mut conn).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("batond closed the connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Bus connection error");
                break;
            }
        };

        match frame.cmd {
            FrameCmd::Deliver => {
                let payload = match String::from_utf8(frame.payload) {
                    Ok(payload) => payload,
                    Err(_) => {
                        warn!(topic = %frame.topic, "Dropping non utf-8 payload");
                        continue;
                    }
                };
                let channels = channels.lock().expect("locking failed");
                for subscriber in channels.get(&frame.topic).into_iter().flat_map(BTreeMap::values) {
                    // we don't care if the subscriber is gone
                    let _ = subscriber.messages_tx.send(payload.clone());
                }
            }
            FrameCmd::Members => {
                let members = match frame.parse_members() {
                    Ok(ids) => Members::from_iter(ids),
                    Err(e) => {
                        warn!(topic = %frame.topic, error = %e, "Invalid members frame");
                        continue;
                    }
                };
                trace!(topic = %frame.topic, count = members.len(), "Members update");
                let channels = channels.lock().expect("locking failed");
                for subscriber in channels.get(&frame.topic).into_iter().flat_map(BTreeMap::values) {
                    subscriber.members_tx.send_replace(members.clone());
                }
            }
            other => {
                warn!(cmd = ?other, "Unexpected frame from batond");
            }
        }
    }

    // disconnect all subscribers
    channels.lock().expect("locking failed").clear();
}

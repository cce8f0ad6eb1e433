use baton_api::{read_frame, ConnectionHello, FrameCmd, FrameError, InstanceId, BATOND_VERSION_0};
use binrw::BinWrite;
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};
use tracing::{debug, error, info, trace};

use crate::task::AutoJoinHandle;

use super::{ConnectionId, NodeShared, OutboundFrame};

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("invalid data: {0}")]
    ParseError(#[from] binrw::Error),
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),
    #[error("unexpected command: {0:?}")]
    UnexpectedCmd(FrameCmd),
    #[error("invalid member id")]
    InvalidMember,
    #[error("io: {0}")]
    IO(#[from] io::Error),
}

pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

pub struct RequestHandler {
    local_addr: SocketAddr,
    #[allow(unused)]
    join_handle: AutoJoinHandle,
}

impl RequestHandler {
    pub fn new(shared: Arc<NodeShared>, listen_addr: SocketAddr) -> anyhow::Result<Self> {
        let inner = Arc::new(RequestHandlerInner { shared });

        let rt = tokio::runtime::Runtime::new()?;

        let (tx, rx) = flume::bounded(1);

        let join_handle =
            AutoJoinHandle::spawn_res("request-handler", move || -> Result<(), io::Error> {
                let panic_guard = inner.shared.panic_guard("request-handler");
                let _guard = scopeguard::guard((), |_| {
                    info!("RequestHandler is done");
                });
                rt.block_on(async {
                    let listener = match TcpListener::bind(listen_addr)
                        .await
                        .and_then(|l| l.local_addr().map(|addr| (l, addr)))
                    {
                        Ok((listener, local_addr)) => {
                            // `new` is blocked waiting for it
                            let _ = tx.send(Ok(local_addr));
                            listener
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            return;
                        }
                    };

                    inner.handle_requests(listener).await;
                });

                // connections are long lived, whatever is still open gets dropped
                info!("Closing remaining connections...");
                rt.shutdown_timeout(Duration::from_secs(1));

                panic_guard.done();
                Ok(())
            })?;

        let local_addr = rx.recv()??;
        info!(%local_addr, "Listening");

        Ok(Self {
            join_handle,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

pub struct RequestHandlerInner {
    shared: Arc<NodeShared>,
}

impl RequestHandlerInner {
    async fn handle_requests(self: &Arc<Self>, listener: TcpListener) {
        while !self.shared.is_node_shutting_down() {
            let (stream, peer_addr) =
                // bound by a timeout, so we can exit after `is_stopped` is set in a reasonable time
                match timeout(Duration::from_millis(500), listener.accept()).await {
                    Ok(Ok(o)) => o,
                    Ok(Err(e)) => {
                        error!(%e, "request handling listener accept error");
                        sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                    Err(_) => {
                        // just a timeout
                        continue;
                    }
                };

            info!(%peer_addr, "New connection");

            let self_copy = self.clone();
            tokio::spawn(async move {
                if let Err(e) = self_copy.handle_connection(stream).await {
                    info!(%peer_addr, "Connection error: {}", e);
                }
            });
        }
    }

    pub async fn handle_connection(&self, stream: TcpStream) -> ConnectionResult<()> {
        // We always prepare whole frames to be sent immediately
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();
        Self::handle_connection_init(&mut writer).await?;

        let (tx, rx) = flume::bounded(self.shared.params.outbound_queue_len.max(1));
        let conn_id = self.shared.add_connection(tx);
        let shared = Arc::clone(&self.shared);
        let _guard = scopeguard::guard((), move |_| {
            debug!(conn_id, "Connection closed");
            shared.remove_connection(conn_id);
        });

        // whichever side finishes first ends the connection
        tokio::select! {
            res = self.handle_connection_loop(conn_id, &mut reader) => res,
            res = Self::handle_outbound(&mut writer, rx) => res,
        }
    }

    pub async fn handle_connection_init(
        stream: &mut (impl AsyncWrite + Unpin),
    ) -> ConnectionResult<()> {
        let hello = ConnectionHello {
            version: BATOND_VERSION_0,
        };

        let mut buf = Vec::with_capacity(ConnectionHello::BYTE_SIZE);
        hello.write(&mut binrw::io::NoSeek::new(&mut buf))?;
        stream.write_all(&buf).await?;
        Ok(())
    }

    async fn handle_outbound(
        stream: &mut (impl AsyncWrite + Unpin),
        rx: flume::Receiver<OutboundFrame>,
    ) -> ConnectionResult<()> {
        // ends once the connection is dropped from the registry
        while let Ok(buf) = rx.recv_async().await {
            stream.write_all(&buf).await?;
        }
        Ok(())
    }

    async fn handle_connection_loop(
        &self,
        conn_id: ConnectionId,
        stream: &mut (impl AsyncRead + Unpin),
    ) -> ConnectionResult<()> {
        while !self.shared.is_node_shutting_down() {
            let Some(frame) = read_frame(stream).await? else {
                return Ok(());
            };
            trace!(
                conn_id,
                cmd = ?frame.cmd,
                topic = %frame.topic,
                len = frame.payload.len(),
                "Received frame"
            );

            match frame.cmd {
                FrameCmd::Join => {
                    let member = parse_member(frame.payload)?;
                    self.shared.join(&frame.topic, member, conn_id);
                }
                FrameCmd::Leave => {
                    let member = parse_member(frame.payload)?;
                    self.shared.leave(&frame.topic, &member, conn_id);
                }
                FrameCmd::Publish => self.shared.publish(&frame.topic, frame.payload, conn_id)?,
                other => return Err(ConnectionError::UnexpectedCmd(other)),
            }
        }
        Ok(())
    }
}

fn parse_member(payload: Vec<u8>) -> ConnectionResult<InstanceId> {
    match String::from_utf8(payload) {
        Ok(id) if !id.is_empty() => Ok(InstanceId::new(id)),
        _ => Err(ConnectionError::InvalidMember),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baton_api::Frame;

    #[tokio::test]
    async fn join_frame_carries_member() -> anyhow::Result<()> {
        let bytes = Frame::new(FrameCmd::Join, "t", "A").encode()?;
        let mut stream = &bytes[..];

        let join = read_frame(&mut stream).await?.unwrap();
        assert_eq!(join.cmd, FrameCmd::Join);
        assert_eq!(parse_member(join.payload)?, InstanceId::from("A"));
        Ok(())
    }

    #[test]
    fn empty_member_is_rejected() {
        assert!(matches!(
            parse_member(vec![]),
            Err(ConnectionError::InvalidMember)
        ));
        assert!(matches!(
            parse_member(vec![0xff]),
            Err(ConnectionError::InvalidMember)
        ));
    }
}

//! `batond` bus protocol
//!
//! After the server sends [`ConnectionHello`], both sides exchange frames:
//! a fixed [`FrameHeader`] followed by `topic_len` bytes of UTF-8 topic and
//! `payload_len` bytes of payload.
use binrw::io::NoSeek;
use binrw::{BinRead, BinWrite};
use num_enum::{FromPrimitive, IntoPrimitive};
use std::io::{self, Cursor};
use thiserror::Error;

use crate::{DecodeError, InstanceId};

pub const BATOND_VERSION_0: u8 = 0;

/// Connection header
///
/// On every connect server sends some initial data.
#[derive(BinRead, BinWrite, Debug, Copy, Clone)]
#[br(big)]
#[bw(big)]
pub struct ConnectionHello {
    /// Protocol version
    pub version: u8,
}

impl ConnectionHello {
    pub const BYTE_SIZE: usize = 1;
}

/// Frame command
#[derive(FromPrimitive, IntoPrimitive, Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
#[repr(u8)]
pub enum FrameCmd {
    /// Become a member of the topic. Payload is the member id.
    Join = 1,
    /// Stop being a member of the topic. Payload is the member id.
    Leave = 2,
    /// Broadcast the payload to all members of the topic
    Publish = 3,
    /// Server delivering a published payload
    Deliver = 16,
    /// Server announcing the current members, a JSON array of ids
    Members = 17,
    #[default]
    Other,
}

#[derive(BinRead, BinWrite, Debug, Copy, Clone, PartialEq, Eq)]
#[br(big)]
#[bw(big)]
pub struct FrameHeader {
    pub cmd: u8,
    pub topic_len: u16,
    pub payload_len: u32,
}

impl FrameHeader {
    pub const BYTE_SIZE: usize = 7;
    pub const MAX_PAYLOAD_LEN: u32 = 1024 * 1024;

    pub fn cmd(&self) -> FrameCmd {
        FrameCmd::from(self.cmd)
    }

    pub fn read_from(buf: &[u8; Self::BYTE_SIZE]) -> Result<Self, FrameError> {
        let header = Self::read(&mut Cursor::new(&buf[..]))?;
        if Self::MAX_PAYLOAD_LEN < header.payload_len {
            return Err(FrameError::PayloadTooLong);
        }
        Ok(header)
    }
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("topic too long")]
    TopicTooLong,
    #[error("payload too long")]
    PayloadTooLong,
    #[error("topic is not valid utf-8")]
    InvalidTopic,
    #[error("invalid header: {0}")]
    Header(#[from] binrw::Error),
    #[error("invalid payload: {0}")]
    Payload(#[from] DecodeError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub cmd: FrameCmd,
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(cmd: FrameCmd, topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            cmd,
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn members<'a>(topic: &str, members: impl IntoIterator<Item = &'a InstanceId>) -> Self {
        let ids: Vec<&InstanceId> = members.into_iter().collect();
        Self::new(
            FrameCmd::Members,
            topic,
            serde_json::to_vec(&ids).expect("can't fail"),
        )
    }

    /// Rebuild a frame from a header and the bytes that followed it
    pub fn from_parts(header: FrameHeader, body: Vec<u8>) -> Result<Self, FrameError> {
        let topic_len = usize::from(header.topic_len);
        debug_assert!(topic_len <= body.len());
        let mut topic = body;
        let payload = topic.split_off(topic_len);
        let topic = String::from_utf8(topic).map_err(|_| FrameError::InvalidTopic)?;

        Ok(Self {
            cmd: header.cmd(),
            topic,
            payload,
        })
    }

    pub fn header(&self) -> Result<FrameHeader, FrameError> {
        let topic_len = u16::try_from(self.topic.len()).map_err(|_| FrameError::TopicTooLong)?;
        let payload_len =
            u32::try_from(self.payload.len()).map_err(|_| FrameError::PayloadTooLong)?;
        if FrameHeader::MAX_PAYLOAD_LEN < payload_len {
            return Err(FrameError::PayloadTooLong);
        }
        Ok(FrameHeader {
            cmd: self.cmd.into(),
            topic_len,
            payload_len,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let header = self.header()?;

        let mut buf =
            Vec::with_capacity(FrameHeader::BYTE_SIZE + self.topic.len() + self.payload.len());
        header
            .write(&mut NoSeek::new(&mut buf))
            .expect("can't fail");
        debug_assert_eq!(buf.len(), FrameHeader::BYTE_SIZE);
        buf.extend_from_slice(self.topic.as_bytes());
        buf.extend_from_slice(&self.payload);

        Ok(buf)
    }

    pub fn parse_members(&self) -> Result<Vec<InstanceId>, FrameError> {
        Ok(serde_json::from_slice(&self.payload).map_err(DecodeError::from)?)
    }
}

/// Read one frame, `None` if the stream ended cleanly before it
#[cfg(feature = "tokio")]
pub async fn read_frame(
    stream: &mut (impl tokio::io::AsyncRead + Unpin),
) -> Result<Option<Frame>, FrameError> {
    use convi::CastFrom;
    use tokio::io::AsyncReadExt;

    let mut header_buf = [0u8; FrameHeader::BYTE_SIZE];
    match stream.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let header = FrameHeader::read_from(&header_buf)?;

    let mut body = vec![0u8; usize::from(header.topic_len) + usize::cast_from(header.payload_len)];
    stream.read_exact(&mut body).await?;

    Ok(Some(Frame::from_parts(header, body)?))
}

#[cfg(feature = "tokio")]
#[tokio::test]
async fn read_frame_until_eof() -> Result<(), FrameError> {
    let mut bytes = Frame::new(FrameCmd::Join, "t", "A").encode()?;
    bytes.extend(Frame::new(FrameCmd::Publish, "t", "{}").encode()?);

    let mut stream = &bytes[..];
    let join = read_frame(&mut stream).await?.unwrap();
    assert_eq!(join.cmd, FrameCmd::Join);
    assert_eq!(join.payload, b"A");
    let publish = read_frame(&mut stream).await?.unwrap();
    assert_eq!(publish.payload, b"{}");
    assert!(read_frame(&mut stream).await?.is_none());

    // a body cut short is an error
    let mut stream = &bytes[..FrameHeader::BYTE_SIZE + 1];
    assert!(matches!(read_frame(&mut stream).await, Err(FrameError::Io(_))));

    Ok(())
}

#[test]
fn frame_encoding() {
    let frame = Frame::new(FrameCmd::Publish, "topic", b"{}".to_vec());
    let bytes = frame.encode().unwrap();
    assert_eq!(&bytes[..FrameHeader::BYTE_SIZE], &[3, 0, 5, 0, 0, 0, 2]);

    let mut header_buf = [0u8; FrameHeader::BYTE_SIZE];
    header_buf.copy_from_slice(&bytes[..FrameHeader::BYTE_SIZE]);
    let header = FrameHeader::read_from(&header_buf).unwrap();
    assert_eq!(header.cmd(), FrameCmd::Publish);

    let decoded = Frame::from_parts(header, bytes[FrameHeader::BYTE_SIZE..].to_vec()).unwrap();
    assert_eq!(decoded, frame);
}

#[test]
fn frame_members_payload() {
    let a = InstanceId::from("A");
    let b = InstanceId::from("B");
    let frame = Frame::members("t", [&a, &b]);
    assert_eq!(frame.payload, br#"["A","B"]"#);
    assert_eq!(frame.parse_members().unwrap(), vec![a, b]);
}

#[test]
fn frame_header_rejects_oversized_payload() {
    let buf = [3u8, 0, 0, 0xff, 0xff, 0xff, 0xff];
    assert!(matches!(
        FrameHeader::read_from(&buf),
        Err(FrameError::PayloadTooLong)
    ));
}

//! Store Wire Protocol
//!
//! Frames exchanged between `RemoteStore` and `StoreServer`. Every frame
//! is a bincode body behind an 8 byte header (length + crc32, little
//! endian).

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{CreateMode, Stat, StoreEvent};
use crate::error::{Error, Result};

/// Largest frame body accepted from a peer
pub const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

/// Client to server requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// First request on every connection; session 0 asks for a new session
    Connect {
        session_id: u64,
        session_timeout_ms: u64,
        read_only: bool,
    },
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
        make_parents: bool,
    },
    Get {
        path: String,
    },
    Exists {
        path: String,
    },
    Set {
        path: String,
        data: Vec<u8>,
        version: Option<u32>,
    },
    Delete {
        path: String,
        recursive: bool,
    },
    Children {
        path: String,
    },
    /// Stream events at or below `prefix` tagged with `watch_id`
    Watch {
        watch_id: u64,
        prefix: String,
    },
    Unwatch {
        watch_id: u64,
    },
    Ping,
    /// End the session for good
    Close,
}

/// Server to client responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Connected {
        session_id: u64,
        session_timeout_ms: u64,
    },
    Created {
        path: String,
    },
    Data {
        data: Vec<u8>,
        stat: Stat,
    },
    Exists {
        stat: Option<Stat>,
    },
    Stat {
        stat: Stat,
    },
    Children {
        children: Vec<String>,
    },
    Ok,
    Pong,
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Error categories that survive the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NoNode,
    NodeExists,
    NotEmpty,
    BadVersion { expected: u32, actual: u32 },
    InvalidPath,
    SessionExpired,
    ReadOnly,
    Protocol,
    Internal,
}

/// Everything that travels over a store connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    Request { xid: u64, request: Request },
    Response { xid: u64, response: Response },
    /// Unsolicited watch notification
    Event { watch_id: u64, event: StoreEvent },
}

impl Frame {
    /// Serialize frame to bytes
    pub fn serialize(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize frame from bytes
    pub fn deserialize(bytes: &[u8]) -> std::result::Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Frame type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Request { request, .. } => request.type_name(),
            Frame::Response { response, .. } => response.type_name(),
            Frame::Event { .. } => "Event",
        }
    }
}

impl Request {
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::Connect { .. } => "Connect",
            Request::Create { .. } => "Create",
            Request::Get { .. } => "Get",
            Request::Exists { .. } => "Exists",
            Request::Set { .. } => "Set",
            Request::Delete { .. } => "Delete",
            Request::Children { .. } => "Children",
            Request::Watch { .. } => "Watch",
            Request::Unwatch { .. } => "Unwatch",
            Request::Ping => "Ping",
            Request::Close => "Close",
        }
    }

    /// Whether the request modifies the tree
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Request::Create { .. } | Request::Set { .. } | Request::Delete { .. }
        )
    }
}

impl Response {
    pub fn type_name(&self) -> &'static str {
        match self {
            Response::Connected { .. } => "Connected",
            Response::Created { .. } => "Created",
            Response::Data { .. } => "Data",
            Response::Exists { .. } => "Exists",
            Response::Stat { .. } => "Stat",
            Response::Children { .. } => "Children",
            Response::Ok => "Ok",
            Response::Pong => "Pong",
            Response::Error { .. } => "Error",
        }
    }

    /// Error response for a failed operation
    pub fn from_error(err: &Error) -> Self {
        let (code, message) = match err {
            Error::NoNode(path) => (ErrorCode::NoNode, path.clone()),
            Error::NodeExists(path) => (ErrorCode::NodeExists, path.clone()),
            Error::NotEmpty(path) => (ErrorCode::NotEmpty, path.clone()),
            Error::BadVersion { path, expected, actual } => (
                ErrorCode::BadVersion {
                    expected: *expected,
                    actual: *actual,
                },
                path.clone(),
            ),
            Error::InvalidPath(path) => (ErrorCode::InvalidPath, path.clone()),
            Error::SessionExpired => (ErrorCode::SessionExpired, String::new()),
            Error::ReadOnly => (ErrorCode::ReadOnly, String::new()),
            Error::Protocol(msg) => (ErrorCode::Protocol, msg.clone()),
            other => (ErrorCode::Internal, other.to_string()),
        };
        Response::Error { code, message }
    }
}

impl ErrorCode {
    /// Rebuild the local error for a wire error
    pub fn into_error(self, message: String) -> Error {
        match self {
            ErrorCode::NoNode => Error::NoNode(message),
            ErrorCode::NodeExists => Error::NodeExists(message),
            ErrorCode::NotEmpty => Error::NotEmpty(message),
            ErrorCode::BadVersion { expected, actual } => Error::BadVersion {
                path: message,
                expected,
                actual,
            },
            ErrorCode::InvalidPath => Error::InvalidPath(message),
            ErrorCode::SessionExpired => Error::SessionExpired,
            ErrorCode::ReadOnly => Error::ReadOnly,
            ErrorCode::Protocol => Error::Protocol(message),
            ErrorCode::Internal => Error::Internal(message),
        }
    }
}

/// Frame header for length-prefixed frames
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Body length
    pub length: u32,
    /// Body checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}

/// Read one frame
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "frame of {} bytes exceeds the {} byte limit",
            header.length, MAX_FRAME_SIZE
        )));
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::Protocol("frame checksum mismatch".into()));
    }

    Ok(Frame::deserialize(&body)?)
}

/// Write one frame
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let body = frame.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Whether a read error just means the peer hung up
pub fn is_disconnect(err: &Error) -> bool {
    match err {
        Error::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_over_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = Frame::Request {
            xid: 7,
            request: Request::Set {
                path: "/nodepool/nodes/0000000001".into(),
                data: b"{\"state\":\"ready\"}".to_vec(),
                version: Some(3),
            },
        };
        write_frame(&mut a, &frame).await.unwrap();

        match read_frame(&mut b).await.unwrap() {
            Frame::Request { xid, request: Request::Set { path, version, .. } } => {
                assert_eq!(xid, 7);
                assert_eq!(path, "/nodepool/nodes/0000000001");
                assert_eq!(version, Some(3));
            }
            other => panic!("unexpected frame {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_corrupt_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let body = Frame::Request { xid: 1, request: Request::Ping }.serialize().unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 0xdead_beef;

        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(&body).await.unwrap();

        assert!(matches!(read_frame(&mut b).await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let header = FrameHeader {
            length: MAX_FRAME_SIZE + 1,
            checksum: 0,
        };
        a.write_all(&header.to_bytes()).await.unwrap();
        assert!(matches!(read_frame(&mut b).await, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_error_codes_keep_details() {
        let err = Error::BadVersion {
            path: "/x".into(),
            expected: 2,
            actual: 5,
        };
        let Response::Error { code, message } = Response::from_error(&err) else {
            panic!("expected an error response");
        };
        assert!(matches!(
            code.into_error(message),
            Error::BadVersion { path, expected: 2, actual: 5 } if path == "/x"
        ));

        let Response::Error { code, .. } = Response::from_error(&Error::ShuttingDown) else {
            panic!("expected an error response");
        };
        assert_eq!(code, ErrorCode::Internal);
    }
}

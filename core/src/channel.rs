//! Framed message channel between the supervisor and the restricted
//! interpreter child.
//!
//! Every intercepted call the child attempts crosses this channel, so the
//! framing is deliberately tiny and host-byte-order independent: a 4-byte
//! big-endian length, then a payload whose first byte names the message
//! kind. The tag alphabet lives in [`drydock_protocol::wire`] and is
//! versioned; an unknown tag is a protocol error that poisons the channel.

use std::collections::BTreeMap;

use bytes::BufMut;
use bytes::BytesMut;
use drydock_protocol::wire::FrameTag;
use drydock_protocol::wire::value_tag;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

use crate::error::DrydockErr;
use crate::error::Result;

/// Upper bound on a single frame. The largest legitimate frames are file
/// writes, which the VFS caps well below this.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A syscall-shaped request from the child. Field order within each frame
/// is fixed; there is no per-field tagging on the request side because the
/// layout is implied by the frame tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildRequest {
    FsStat {
        vpath: String,
    },
    FsOpenRead {
        vpath: String,
    },
    FsRead {
        handle: u64,
        offset: u64,
        len: u64,
    },
    FsClose {
        handle: u64,
    },
    FsReaddir {
        vpath: String,
    },
    FsOpenWrite {
        vpath: String,
        mode: u64,
    },
    FsWrite {
        handle: u64,
        bytes: Vec<u8>,
    },
    FsCloseWrite {
        handle: u64,
    },
    FsReadlink {
        vpath: String,
    },
    ProcSpawn {
        argv: Vec<String>,
        cwd: String,
        env_delta: BTreeMap<String, String>,
        stdin: Option<Vec<u8>>,
        /// Set when the script treats a non-zero exit as fatal; replay
        /// stops at the first failing required op.
        required: bool,
    },
    SignalQuery {
        signo: i64,
    },
    SignalAction {
        signo: i64,
        action: i64,
    },
    SockCreate {
        family: i64,
        socktype: i64,
        protocol: i64,
    },
}

impl ChildRequest {
    fn tag(&self) -> FrameTag {
        match self {
            ChildRequest::FsStat { .. } => FrameTag::FsStat,
            ChildRequest::FsOpenRead { .. } => FrameTag::FsOpenRead,
            ChildRequest::FsRead { .. } => FrameTag::FsRead,
            ChildRequest::FsClose { .. } => FrameTag::FsClose,
            ChildRequest::FsReaddir { .. } => FrameTag::FsReaddir,
            ChildRequest::FsOpenWrite { .. } => FrameTag::FsOpenWrite,
            ChildRequest::FsWrite { .. } => FrameTag::FsWrite,
            ChildRequest::FsCloseWrite { .. } => FrameTag::FsCloseWrite,
            ChildRequest::FsReadlink { .. } => FrameTag::FsReadlink,
            ChildRequest::ProcSpawn { .. } => FrameTag::ProcSpawn,
            ChildRequest::SignalQuery { .. } => FrameTag::SignalQuery,
            ChildRequest::SignalAction { .. } => FrameTag::SignalAction,
            ChildRequest::SockCreate { .. } => FrameTag::SockCreate,
        }
    }
}

/// A request plus the id the reply must echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub request_id: u32,
    pub request: ChildRequest,
}

/// Everything the supervisor can pull off the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Request(RequestFrame),
    /// A diagnostic line from the child's runtime, surfaced via tracing.
    Log { level: u8, line: String },
}

/// A typed value inside a reply payload. Replies are self-describing value
/// sequences because their layout depends on which request they answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireValue {
    U64(u64),
    I64(i64),
    Bytes(Vec<u8>),
    Str(String),
    List(Vec<WireValue>),
    None,
    Some(Box<WireValue>),
}

impl WireValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            WireValue::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            WireValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            WireValue::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            WireValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostReply {
    /// Successful reply carrying zero or more values.
    Values(Vec<WireValue>),
    /// Errno-like failure the child maps onto its native exceptions.
    Error { code: i32, message: String },
}

impl HostReply {
    pub fn empty() -> Self {
        HostReply::Values(Vec::new())
    }

    pub fn error(err: &DrydockErr) -> Self {
        HostReply::Error {
            code: err.errno_code(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyFrame {
    pub request_id: u32,
    pub reply: HostReply,
}

// ---------------------------------------------------------------------------
// Payload encode/decode
// ---------------------------------------------------------------------------

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_bytes(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u32(b.len() as u32);
    buf.put_slice(b);
}

fn take_u8(input: &mut &[u8]) -> Result<u8> {
    let (&first, rest) = input
        .split_first()
        .ok_or_else(|| DrydockErr::Protocol("frame truncated reading u8".to_string()))?;
    *input = rest;
    Ok(first)
}

fn take_array<const N: usize>(input: &mut &[u8]) -> Result<[u8; N]> {
    if input.len() < N {
        return Err(DrydockErr::Protocol(format!(
            "frame truncated: wanted {N} bytes, had {}",
            input.len()
        )));
    }
    let (head, rest) = input.split_at(N);
    let mut out = [0u8; N];
    out.copy_from_slice(head);
    *input = rest;
    Ok(out)
}

fn take_u32(input: &mut &[u8]) -> Result<u32> {
    Ok(u32::from_be_bytes(take_array::<4>(input)?))
}

fn take_u64(input: &mut &[u8]) -> Result<u64> {
    Ok(u64::from_be_bytes(take_array::<8>(input)?))
}

fn take_i64(input: &mut &[u8]) -> Result<i64> {
    Ok(i64::from_be_bytes(take_array::<8>(input)?))
}

fn take_i32(input: &mut &[u8]) -> Result<i32> {
    Ok(i32::from_be_bytes(take_array::<4>(input)?))
}

fn take_bytes(input: &mut &[u8]) -> Result<Vec<u8>> {
    let len = take_u32(input)? as usize;
    if input.len() < len {
        return Err(DrydockErr::Protocol(format!(
            "frame truncated: wanted {len} payload bytes, had {}",
            input.len()
        )));
    }
    let (head, rest) = input.split_at(len);
    let out = head.to_vec();
    *input = rest;
    Ok(out)
}

fn take_str(input: &mut &[u8]) -> Result<String> {
    String::from_utf8(take_bytes(input)?)
        .map_err(|_| DrydockErr::Protocol("string field is not UTF-8".to_string()))
}

fn put_value(buf: &mut BytesMut, value: &WireValue) {
    match value {
        WireValue::U64(v) => {
            buf.put_u8(value_tag::U64);
            buf.put_u64(*v);
        }
        WireValue::I64(v) => {
            buf.put_u8(value_tag::I64);
            buf.put_i64(*v);
        }
        WireValue::Bytes(v) => {
            buf.put_u8(value_tag::BYTES);
            put_bytes(buf, v);
        }
        WireValue::Str(v) => {
            buf.put_u8(value_tag::STR);
            put_str(buf, v);
        }
        WireValue::List(items) => {
            buf.put_u8(value_tag::LIST);
            buf.put_u32(items.len() as u32);
            for item in items {
                put_value(buf, item);
            }
        }
        WireValue::None => buf.put_u8(value_tag::NONE),
        WireValue::Some(inner) => {
            buf.put_u8(value_tag::SOME);
            put_value(buf, inner);
        }
    }
}

fn take_value(input: &mut &[u8]) -> Result<WireValue> {
    match take_u8(input)? {
        value_tag::U64 => Ok(WireValue::U64(take_u64(input)?)),
        value_tag::I64 => Ok(WireValue::I64(take_i64(input)?)),
        value_tag::BYTES => Ok(WireValue::Bytes(take_bytes(input)?)),
        value_tag::STR => Ok(WireValue::Str(take_str(input)?)),
        value_tag::LIST => {
            let count = take_u32(input)? as usize;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                items.push(take_value(input)?);
            }
            Ok(WireValue::List(items))
        }
        value_tag::NONE => Ok(WireValue::None),
        value_tag::SOME => Ok(WireValue::Some(Box::new(take_value(input)?))),
        other => Err(DrydockErr::Protocol(format!(
            "unknown value tag {other:#04x}"
        ))),
    }
}

impl RequestFrame {
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.request.tag().code());
        buf.put_u32(self.request_id);
        match &self.request {
            ChildRequest::FsStat { vpath }
            | ChildRequest::FsOpenRead { vpath }
            | ChildRequest::FsReaddir { vpath }
            | ChildRequest::FsReadlink { vpath } => put_str(&mut buf, vpath),
            ChildRequest::FsRead {
                handle,
                offset,
                len,
            } => {
                buf.put_u64(*handle);
                buf.put_u64(*offset);
                buf.put_u64(*len);
            }
            ChildRequest::FsClose { handle } | ChildRequest::FsCloseWrite { handle } => {
                buf.put_u64(*handle)
            }
            ChildRequest::FsOpenWrite { vpath, mode } => {
                put_str(&mut buf, vpath);
                buf.put_u64(*mode);
            }
            ChildRequest::FsWrite { handle, bytes } => {
                buf.put_u64(*handle);
                put_bytes(&mut buf, bytes);
            }
            ChildRequest::ProcSpawn {
                argv,
                cwd,
                env_delta,
                stdin,
                required,
            } => {
                buf.put_u32(argv.len() as u32);
                for arg in argv {
                    put_str(&mut buf, arg);
                }
                put_str(&mut buf, cwd);
                buf.put_u32(env_delta.len() as u32);
                for (key, value) in env_delta {
                    put_str(&mut buf, &format!("{key}={value}"));
                }
                match stdin {
                    Some(bytes) => {
                        buf.put_u8(1);
                        put_bytes(&mut buf, bytes);
                    }
                    None => buf.put_u8(0),
                }
                buf.put_u8(u8::from(*required));
            }
            ChildRequest::SignalQuery { signo } => buf.put_i64(*signo),
            ChildRequest::SignalAction { signo, action } => {
                buf.put_i64(*signo);
                buf.put_i64(*action);
            }
            ChildRequest::SockCreate {
                family,
                socktype,
                protocol,
            } => {
                buf.put_i64(*family);
                buf.put_i64(*socktype);
                buf.put_i64(*protocol);
            }
        }
        buf.to_vec()
    }
}

fn decode_request(tag: FrameTag, input: &mut &[u8]) -> Result<ChildRequest> {
    let request = match tag {
        FrameTag::FsStat => ChildRequest::FsStat {
            vpath: take_str(input)?,
        },
        FrameTag::FsOpenRead => ChildRequest::FsOpenRead {
            vpath: take_str(input)?,
        },
        FrameTag::FsRead => ChildRequest::FsRead {
            handle: take_u64(input)?,
            offset: take_u64(input)?,
            len: take_u64(input)?,
        },
        FrameTag::FsClose => ChildRequest::FsClose {
            handle: take_u64(input)?,
        },
        FrameTag::FsReaddir => ChildRequest::FsReaddir {
            vpath: take_str(input)?,
        },
        FrameTag::FsOpenWrite => ChildRequest::FsOpenWrite {
            vpath: take_str(input)?,
            mode: take_u64(input)?,
        },
        FrameTag::FsWrite => ChildRequest::FsWrite {
            handle: take_u64(input)?,
            bytes: take_bytes(input)?,
        },
        FrameTag::FsCloseWrite => ChildRequest::FsCloseWrite {
            handle: take_u64(input)?,
        },
        FrameTag::FsReadlink => ChildRequest::FsReadlink {
            vpath: take_str(input)?,
        },
        FrameTag::ProcSpawn => {
            let argc = take_u32(input)? as usize;
            let mut argv = Vec::with_capacity(argc.min(1024));
            for _ in 0..argc {
                argv.push(take_str(input)?);
            }
            let cwd = take_str(input)?;
            let envc = take_u32(input)? as usize;
            let mut env_delta = BTreeMap::new();
            for _ in 0..envc {
                let entry = take_str(input)?;
                let (key, value) = entry.split_once('=').ok_or_else(|| {
                    DrydockErr::Protocol("env delta entry without '='".to_string())
                })?;
                env_delta.insert(key.to_string(), value.to_string());
            }
            let stdin = match take_u8(input)? {
                0 => None,
                1 => Some(take_bytes(input)?),
                other => {
                    return Err(DrydockErr::Protocol(format!(
                        "bad stdin presence byte {other:#04x}"
                    )));
                }
            };
            let required = take_u8(input)? != 0;
            ChildRequest::ProcSpawn {
                argv,
                cwd,
                env_delta,
                stdin,
                required,
            }
        }
        FrameTag::SignalQuery => ChildRequest::SignalQuery {
            signo: take_i64(input)?,
        },
        FrameTag::SignalAction => ChildRequest::SignalAction {
            signo: take_i64(input)?,
            action: take_i64(input)?,
        },
        FrameTag::SockCreate => ChildRequest::SockCreate {
            family: take_i64(input)?,
            socktype: take_i64(input)?,
            protocol: take_i64(input)?,
        },
        FrameTag::Reply
        | FrameTag::ErrorReply
        | FrameTag::LogLine
        | FrameTag::Keepalive => {
            return Err(DrydockErr::Internal(format!(
                "decode_request called with non-request tag {tag:?}"
            )));
        }
    };
    Ok(request)
}

/// Decode one inbound payload (everything after the length prefix).
pub fn decode_inbound(payload: &[u8]) -> Result<Option<InboundFrame>> {
    let mut input = payload;
    let tag_byte = take_u8(&mut input)?;
    let tag = FrameTag::from_code(tag_byte)
        .ok_or_else(|| DrydockErr::Protocol(format!("unknown frame tag {tag_byte:#04x}")))?;

    match tag {
        FrameTag::Keepalive => Ok(None),
        FrameTag::LogLine => {
            // Log lines carry no request id; nothing is ever sent back.
            let level = take_u8(&mut input)?;
            let line = take_str(&mut input)?;
            Ok(Some(InboundFrame::Log { level, line }))
        }
        FrameTag::Reply | FrameTag::ErrorReply => Err(DrydockErr::Protocol(format!(
            "child sent host-only tag {tag_byte:#04x}"
        ))),
        _ => {
            let request_id = take_u32(&mut input)?;
            let request = decode_request(tag, &mut input)?;
            if !input.is_empty() {
                return Err(DrydockErr::Protocol(format!(
                    "{} trailing bytes after request body",
                    input.len()
                )));
            }
            Ok(Some(InboundFrame::Request(RequestFrame {
                request_id,
                request,
            })))
        }
    }
}

impl ReplyFrame {
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        match &self.reply {
            HostReply::Values(values) => {
                buf.put_u8(FrameTag::Reply.code());
                buf.put_u32(self.request_id);
                buf.put_u32(values.len() as u32);
                for value in values {
                    put_value(&mut buf, value);
                }
            }
            HostReply::Error { code, message } => {
                buf.put_u8(FrameTag::ErrorReply.code());
                buf.put_u32(self.request_id);
                buf.put_u8(value_tag::ERROR);
                buf.put_i32(*code);
                put_str(&mut buf, message);
            }
        }
        buf.to_vec()
    }

    /// Decode a host→child payload. Used by the child side of the contract
    /// and by in-process fake children in tests.
    pub fn decode_payload(payload: &[u8]) -> Result<Self> {
        let mut input = payload;
        let tag_byte = take_u8(&mut input)?;
        match FrameTag::from_code(tag_byte) {
            Some(FrameTag::Reply) => {
                let request_id = take_u32(&mut input)?;
                let count = take_u32(&mut input)? as usize;
                let mut values = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    values.push(take_value(&mut input)?);
                }
                Ok(ReplyFrame {
                    request_id,
                    reply: HostReply::Values(values),
                })
            }
            Some(FrameTag::ErrorReply) => {
                let request_id = take_u32(&mut input)?;
                let marker = take_u8(&mut input)?;
                if marker != value_tag::ERROR {
                    return Err(DrydockErr::Protocol(format!(
                        "error reply missing error marker, got {marker:#04x}"
                    )));
                }
                let code = take_i32(&mut input)?;
                let message = take_str(&mut input)?;
                Ok(ReplyFrame {
                    request_id,
                    reply: HostReply::Error { code, message },
                })
            }
            _ => Err(DrydockErr::Protocol(format!(
                "unexpected reply tag {tag_byte:#04x}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Framed transport
// ---------------------------------------------------------------------------

/// Reading half of the channel. Owned by the supervisor's frame task; no
/// other code touches it.
pub struct FrameReader<R> {
    reader: R,
    poisoned: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            poisoned: false,
        }
    }

    /// Block until one full frame is available. Returns `Ok(None)` on a
    /// clean EOF at a frame boundary. Keepalives are consumed silently.
    /// Any framing violation poisons the reader: all subsequent calls
    /// fail.
    pub async fn recv(&mut self) -> Result<Option<InboundFrame>> {
        loop {
            if self.poisoned {
                return Err(DrydockErr::Protocol("channel is poisoned".to_string()));
            }
            let len = match self.read_len_prefix().await? {
                Some(len) => len,
                None => return Ok(None),
            };
            if len == 0 {
                // Zero-length frame is the wire-level keepalive.
                continue;
            }
            if len > MAX_FRAME_LEN {
                self.poisoned = true;
                return Err(DrydockErr::Protocol(format!(
                    "frame length {len} exceeds cap {MAX_FRAME_LEN}"
                )));
            }
            let mut payload = vec![0u8; len];
            if let Err(e) = self.reader.read_exact(&mut payload).await {
                self.poisoned = true;
                return Err(DrydockErr::ChildCrashed(format!(
                    "channel truncated mid-frame: {e}"
                )));
            }
            match decode_inbound(&payload) {
                Ok(Some(frame)) => return Ok(Some(frame)),
                Ok(None) => continue,
                Err(e) => {
                    self.poisoned = true;
                    return Err(e);
                }
            }
        }
    }

    /// Read the 4-byte length prefix, distinguishing clean EOF (no bytes)
    /// from a torn prefix.
    async fn read_len_prefix(&mut self) -> Result<Option<usize>> {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                self.poisoned = true;
                return Err(DrydockErr::ChildCrashed(
                    "channel truncated inside a frame header".to_string(),
                ));
            }
            filled += n;
        }
        Ok(Some(u32::from_be_bytes(buf) as usize))
    }
}

/// Writing half of the channel. Single writer: the supervisor's reply
/// task.
pub struct FrameWriter<W> {
    writer: W,
    closed: bool,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            closed: false,
        }
    }

    pub async fn send(&mut self, frame: &ReplyFrame) -> Result<()> {
        if self.closed {
            return Err(DrydockErr::ChildCrashed(
                "channel already closed".to_string(),
            ));
        }
        let payload = frame.encode_payload();
        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);
        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Close the write half. Idempotent; the child observes EOF.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use maplit::btreemap;
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncWriteExt;
    use tokio::io::duplex;

    use super::*;

    fn sample_requests() -> Vec<ChildRequest> {
        vec![
            ChildRequest::FsStat {
                vpath: "/etc/hosts".to_string(),
            },
            ChildRequest::FsOpenRead {
                vpath: "/etc/hosts".to_string(),
            },
            ChildRequest::FsRead {
                handle: 3,
                offset: 128,
                len: 4096,
            },
            ChildRequest::FsClose { handle: 3 },
            ChildRequest::FsReaddir {
                vpath: "/tmp".to_string(),
            },
            ChildRequest::FsOpenWrite {
                vpath: "/tmp/out".to_string(),
                mode: 0o644,
            },
            ChildRequest::FsWrite {
                handle: 4,
                bytes: b"payload".to_vec(),
            },
            ChildRequest::FsCloseWrite { handle: 4 },
            ChildRequest::FsReadlink {
                vpath: "/proc/self/exe".to_string(),
            },
            ChildRequest::ProcSpawn {
                argv: vec!["ls".to_string(), "-l".to_string()],
                cwd: "/workspace".to_string(),
                env_delta: btreemap! {
                    "LANG".to_string() => "C".to_string(),
                },
                stdin: Some(b"input".to_vec()),
                required: true,
            },
            ChildRequest::SignalQuery { signo: 15 },
            ChildRequest::SignalAction {
                signo: 15,
                action: 1,
            },
            ChildRequest::SockCreate {
                family: 2,
                socktype: 1,
                protocol: 0,
            },
        ]
    }

    #[test]
    fn every_request_roundtrips_through_its_payload() {
        for (id, request) in sample_requests().into_iter().enumerate() {
            let frame = RequestFrame {
                request_id: id as u32,
                request,
            };
            let payload = frame.encode_payload();
            let decoded = decode_inbound(&payload)
                .expect("decode")
                .expect("not a keepalive");
            assert_eq!(InboundFrame::Request(frame), decoded);
        }
    }

    #[test]
    fn replies_roundtrip_including_nested_values() {
        let frame = ReplyFrame {
            request_id: 9,
            reply: HostReply::Values(vec![
                WireValue::U64(42),
                WireValue::I64(-1),
                WireValue::Bytes(b"abc".to_vec()),
                WireValue::Str("name".to_string()),
                WireValue::List(vec![
                    WireValue::List(vec![
                        WireValue::Str("entry".to_string()),
                        WireValue::U64(0),
                    ]),
                    WireValue::None,
                    WireValue::Some(Box::new(WireValue::U64(7))),
                ]),
            ]),
        };
        let decoded = ReplyFrame::decode_payload(&frame.encode_payload()).expect("decode");
        assert_eq!(frame, decoded);

        let err = ReplyFrame {
            request_id: 10,
            reply: HostReply::Error {
                code: libc::ENOENT,
                message: "not found: /nope".to_string(),
            },
        };
        let decoded = ReplyFrame::decode_payload(&err.encode_payload()).expect("decode");
        assert_eq!(err, decoded);
    }

    #[tokio::test]
    async fn reader_skips_keepalives_and_stops_cleanly_at_eof() {
        let (client, server) = duplex(4096);
        let mut reader = FrameReader::new(server);

        let mut child = client;
        // Zero-length keepalive, then a real frame, then EOF.
        child.write_all(&0u32.to_be_bytes()).await.expect("write");
        let frame = RequestFrame {
            request_id: 1,
            request: ChildRequest::FsStat {
                vpath: "/etc".to_string(),
            },
        };
        let payload = frame.encode_payload();
        child
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await
            .expect("write");
        child.write_all(&payload).await.expect("write");
        drop(child);

        assert_eq!(
            Some(InboundFrame::Request(frame)),
            reader.recv().await.expect("recv")
        );
        assert_eq!(None, reader.recv().await.expect("eof"));
    }

    #[tokio::test]
    async fn unknown_tag_poisons_the_reader() {
        let (client, server) = duplex(4096);
        let mut reader = FrameReader::new(server);

        let mut child = client;
        let payload = [0x7Au8, 0, 0, 0, 0];
        child
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await
            .expect("write");
        child.write_all(&payload).await.expect("write");

        assert!(matches!(
            reader.recv().await,
            Err(DrydockErr::Protocol(_))
        ));
        // Poisoned: even though more bytes could arrive, recv keeps failing.
        assert!(matches!(
            reader.recv().await,
            Err(DrydockErr::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn truncated_frame_is_a_child_crash() {
        let (client, server) = duplex(4096);
        let mut reader = FrameReader::new(server);

        let mut child = client;
        child.write_all(&64u32.to_be_bytes()).await.expect("write");
        child.write_all(&[0x01, 0x00]).await.expect("write");
        drop(child);

        assert!(matches!(
            reader.recv().await,
            Err(DrydockErr::ChildCrashed(_))
        ));
    }

    #[tokio::test]
    async fn writer_close_is_idempotent() {
        let (client, _server) = duplex(4096);
        let mut writer = FrameWriter::new(client);
        writer.close().await.expect("close");
        writer.close().await.expect("close again");
        assert!(
            writer
                .send(&ReplyFrame {
                    request_id: 0,
                    reply: HostReply::empty(),
                })
                .await
                .is_err()
        );
    }
}

//! Stream message codec for the shared-memory dataplane protocol.
//!
//! Every message starts with a fixed 16-byte header:
//! ```text
//!  +----------------+----------------+--------------------------------+
//!  |  type id (32)  |  length (32)   |          stream id (64)        |
//!  +----------------+----------------+--------------------------------+
//!  |                      type-specific body ...                      |
//!  +-------------------------------------------------------------------+
//! ```
//! `length` counts body bytes only.  All integers are little-endian.
//! String fields are length-prefixed; an absent optional string is encoded
//! with the length sentinel `0xffff_ffff` and is distinct from an empty
//! string (length 0).
//!
//! Bit 63 of a stream id marks the reply direction: clear for
//! peer-initiated (accept) streams, set for the paired reply stream.

use crate::error::Error;

// Message type constants.
pub const MSG_BEGIN: u32 = 0x01;
pub const MSG_DATA: u32 = 0x02;
pub const MSG_END: u32 = 0x03;
pub const MSG_ABORT: u32 = 0x04;
pub const MSG_WINDOW: u32 = 0x05;
pub const MSG_RESET: u32 = 0x06;
pub const MSG_SIGNAL: u32 = 0x07;

/// Fixed header size preceding every message body.
pub const HEADER_LEN: usize = 16;

/// Reply-direction bit of a stream id.
pub const REPLY_BIT: u64 = 1 << 63;

/// Signal id posted by the executor when a delegated handshake task
/// completes.
pub const FLUSH_HANDSHAKE_SIGNAL: u64 = 1;

/// Largest DATA payload a single message may carry.
pub const MAX_PAYLOAD_LENGTH: usize = (1 << 16) - 1;

/// Length sentinel for an absent optional string.
const ABSENT: u32 = u32::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Begin {
    pub route_id: u64,
    pub stream_id: u64,
    pub trace_id: u64,
    pub authorization: u64,
    pub correlation_id: u64,
    /// Raw extension bytes; empty when the sender attached none.
    pub extension: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    pub route_id: u64,
    pub stream_id: u64,
    pub trace_id: u64,
    pub authorization: u64,
    pub group_id: u64,
    pub padding: i32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct End {
    pub route_id: u64,
    pub stream_id: u64,
    pub trace_id: u64,
    pub authorization: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abort {
    pub route_id: u64,
    pub stream_id: u64,
    pub trace_id: u64,
    pub authorization: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub route_id: u64,
    pub stream_id: u64,
    pub trace_id: u64,
    pub credit: i32,
    pub padding: i32,
    pub group_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reset {
    pub route_id: u64,
    pub stream_id: u64,
    pub trace_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal {
    pub route_id: u64,
    pub stream_id: u64,
    pub trace_id: u64,
    pub authorization: u64,
    pub signal_id: u64,
}

/// Decoded stream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Begin(Begin),
    Data(Data),
    End(End),
    Abort(Abort),
    Window(Window),
    Reset(Reset),
    Signal(Signal),
}

impl Message {
    pub fn type_id(&self) -> u32 {
        match self {
            Message::Begin(_) => MSG_BEGIN,
            Message::Data(_) => MSG_DATA,
            Message::End(_) => MSG_END,
            Message::Abort(_) => MSG_ABORT,
            Message::Window(_) => MSG_WINDOW,
            Message::Reset(_) => MSG_RESET,
            Message::Signal(_) => MSG_SIGNAL,
        }
    }

    pub fn stream_id(&self) -> u64 {
        match self {
            Message::Begin(m) => m.stream_id,
            Message::Data(m) => m.stream_id,
            Message::End(m) => m.stream_id,
            Message::Abort(m) => m.stream_id,
            Message::Window(m) => m.stream_id,
            Message::Reset(m) => m.stream_id,
            Message::Signal(m) => m.stream_id,
        }
    }

    pub fn route_id(&self) -> u64 {
        match self {
            Message::Begin(m) => m.route_id,
            Message::Data(m) => m.route_id,
            Message::End(m) => m.route_id,
            Message::Abort(m) => m.route_id,
            Message::Window(m) => m.route_id,
            Message::Reset(m) => m.route_id,
            Message::Signal(m) => m.route_id,
        }
    }

    /// Encode into a fresh buffer, header included.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 48);
        buf.extend_from_slice(&self.type_id().to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // body length, patched below
        buf.extend_from_slice(&self.stream_id().to_le_bytes());

        match self {
            Message::Begin(m) => {
                put_u64(&mut buf, m.route_id);
                put_u64(&mut buf, m.trace_id);
                put_u64(&mut buf, m.authorization);
                put_u64(&mut buf, m.correlation_id);
                put_u32(&mut buf, m.extension.len() as u32);
                buf.extend_from_slice(&m.extension);
            }
            Message::Data(m) => {
                put_u64(&mut buf, m.route_id);
                put_u64(&mut buf, m.trace_id);
                put_u64(&mut buf, m.authorization);
                put_u64(&mut buf, m.group_id);
                put_u32(&mut buf, m.padding as u32);
                put_u32(&mut buf, m.payload.len() as u32);
                buf.extend_from_slice(&m.payload);
            }
            Message::End(m) => {
                put_u64(&mut buf, m.route_id);
                put_u64(&mut buf, m.trace_id);
                put_u64(&mut buf, m.authorization);
            }
            Message::Abort(m) => {
                put_u64(&mut buf, m.route_id);
                put_u64(&mut buf, m.trace_id);
                put_u64(&mut buf, m.authorization);
            }
            Message::Window(m) => {
                put_u64(&mut buf, m.route_id);
                put_u64(&mut buf, m.trace_id);
                put_u32(&mut buf, m.credit as u32);
                put_u32(&mut buf, m.padding as u32);
                put_u64(&mut buf, m.group_id);
            }
            Message::Reset(m) => {
                put_u64(&mut buf, m.route_id);
                put_u64(&mut buf, m.trace_id);
            }
            Message::Signal(m) => {
                put_u64(&mut buf, m.route_id);
                put_u64(&mut buf, m.trace_id);
                put_u64(&mut buf, m.authorization);
                put_u64(&mut buf, m.signal_id);
            }
        }

        let body_len = (buf.len() - HEADER_LEN) as u32;
        buf[4..8].copy_from_slice(&body_len.to_le_bytes());
        buf
    }

    /// Decode one complete message, header included.
    pub fn decode(buf: &[u8]) -> Result<Message, Error> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Truncated { needed: HEADER_LEN });
        }
        let type_id = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let length = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        let stream_id = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let total = HEADER_LEN + length;
        if buf.len() < total {
            return Err(Error::Truncated { needed: total });
        }
        let body = &buf[HEADER_LEN..total];
        let mut r = Reader::new(body);

        let msg = match type_id {
            MSG_BEGIN => {
                let route_id = r.u64()?;
                let trace_id = r.u64()?;
                let authorization = r.u64()?;
                let correlation_id = r.u64()?;
                let extension = r.bytes()?.to_vec();
                Message::Begin(Begin {
                    route_id,
                    stream_id,
                    trace_id,
                    authorization,
                    correlation_id,
                    extension,
                })
            }
            MSG_DATA => {
                let route_id = r.u64()?;
                let trace_id = r.u64()?;
                let authorization = r.u64()?;
                let group_id = r.u64()?;
                let padding = r.u32()? as i32;
                let payload = r.bytes()?.to_vec();
                Message::Data(Data {
                    route_id,
                    stream_id,
                    trace_id,
                    authorization,
                    group_id,
                    padding,
                    payload,
                })
            }
            MSG_END => Message::End(End {
                route_id: r.u64()?,
                stream_id,
                trace_id: r.u64()?,
                authorization: r.u64()?,
            }),
            MSG_ABORT => Message::Abort(Abort {
                route_id: r.u64()?,
                stream_id,
                trace_id: r.u64()?,
                authorization: r.u64()?,
            }),
            MSG_WINDOW => Message::Window(Window {
                route_id: r.u64()?,
                stream_id,
                trace_id: r.u64()?,
                credit: r.u32()? as i32,
                padding: r.u32()? as i32,
                group_id: r.u64()?,
            }),
            MSG_RESET => Message::Reset(Reset {
                route_id: r.u64()?,
                stream_id,
                trace_id: r.u64()?,
            }),
            MSG_SIGNAL => Message::Signal(Signal {
                route_id: r.u64()?,
                stream_id,
                trace_id: r.u64()?,
                authorization: r.u64()?,
                signal_id: r.u64()?,
            }),
            other => return Err(Error::UnknownType(other)),
        };
        Ok(msg)
    }
}

/// TLS-specific BEGIN extension: the SNI hostname and negotiated (or
/// requested) application protocol.  Both fields are optional and an
/// absent field is distinct from an empty one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsBeginEx {
    pub hostname: Option<String>,
    pub application_protocol: Option<String>,
}

impl TlsBeginEx {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_opt_str(&mut buf, self.hostname.as_deref());
        put_opt_str(&mut buf, self.application_protocol.as_deref());
        buf
    }

    /// Decode from raw extension bytes.  Empty bytes decode as both fields
    /// absent (a BEGIN without the TLS extension).
    pub fn decode(ext: &[u8]) -> Result<TlsBeginEx, Error> {
        if ext.is_empty() {
            return Ok(TlsBeginEx::default());
        }
        let mut r = Reader::new(ext);
        Ok(TlsBeginEx {
            hostname: r.opt_str()?,
            application_protocol: r.opt_str()?,
        })
    }
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_opt_str(buf: &mut Vec<u8>, s: Option<&str>) {
    match s {
        None => put_u32(buf, ABSENT),
        Some(s) => {
            put_u32(buf, s.len() as u32);
            buf.extend_from_slice(s.as_bytes());
        }
    }
}

/// Bounds-checked body reader.
struct Reader<'a> {
    body: &'a [u8],
    off: usize,
}

impl<'a> Reader<'a> {
    fn new(body: &'a [u8]) -> Self {
        Self { body, off: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.body.len() - self.off < n {
            return Err(Error::Truncated { needed: self.off + n });
        }
        let out = &self.body[self.off..self.off + n];
        self.off += n;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, Error> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// Length-prefixed byte field.
    fn bytes(&mut self) -> Result<&'a [u8], Error> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    /// Length-prefixed optional UTF-8 string; `ABSENT` sentinel maps to
    /// `None`.
    fn opt_str(&mut self) -> Result<Option<String>, Error> {
        let len = self.u32()?;
        if len == ABSENT {
            return Ok(None);
        }
        let raw = self.take(len as usize)?;
        std::str::from_utf8(raw)
            .map(|s| Some(s.to_string()))
            .map_err(|_| Error::MalformedString)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_roundtrip() {
        let msg = Message::Begin(Begin {
            route_id: 0x11,
            stream_id: 0x22,
            trace_id: 0x33,
            authorization: 0x44,
            correlation_id: 0x55,
            extension: TlsBeginEx {
                hostname: Some("example.net".into()),
                application_protocol: Some("h2".into()),
            }
            .encode(),
        });
        let bytes = msg.encode();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
        let Message::Begin(b) = decoded else {
            unreachable!()
        };
        let ex = TlsBeginEx::decode(&b.extension).unwrap();
        assert_eq!(ex.hostname.as_deref(), Some("example.net"));
        assert_eq!(ex.application_protocol.as_deref(), Some("h2"));
    }

    #[test]
    fn data_roundtrip() {
        let msg = Message::Data(Data {
            route_id: 1,
            stream_id: REPLY_BIT | 9,
            trace_id: 2,
            authorization: 0,
            group_id: 0,
            padding: 17,
            payload: vec![0xab; 300],
        });
        let bytes = msg.encode();
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn window_negative_credit_roundtrip() {
        let msg = Message::Window(Window {
            route_id: 1,
            stream_id: 5,
            trace_id: 0,
            credit: -4096,
            padding: 281,
            group_id: 0,
        });
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn signal_roundtrip() {
        let msg = Message::Signal(Signal {
            route_id: 1,
            stream_id: 5,
            trace_id: 0,
            authorization: 0,
            signal_id: FLUSH_HANDSHAKE_SIGNAL,
        });
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn absent_string_distinct_from_empty() {
        let absent = TlsBeginEx {
            hostname: None,
            application_protocol: None,
        };
        let empty = TlsBeginEx {
            hostname: Some(String::new()),
            application_protocol: None,
        };
        let absent_bytes = absent.encode();
        let empty_bytes = empty.encode();
        assert_ne!(absent_bytes, empty_bytes);
        assert_eq!(TlsBeginEx::decode(&absent_bytes).unwrap(), absent);
        assert_eq!(TlsBeginEx::decode(&empty_bytes).unwrap(), empty);
    }

    #[test]
    fn empty_extension_decodes_as_no_fields() {
        let ex = TlsBeginEx::decode(&[]).unwrap();
        assert_eq!(ex.hostname, None);
        assert_eq!(ex.application_protocol, None);
    }

    #[test]
    fn truncated_header_rejected() {
        assert!(matches!(
            Message::decode(&[0u8; 10]),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn truncated_body_rejected() {
        let mut bytes = Message::End(End {
            route_id: 1,
            stream_id: 2,
            trace_id: 3,
            authorization: 0,
        })
        .encode();
        bytes.truncate(bytes.len() - 4);
        assert!(matches!(
            Message::decode(&bytes),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn unknown_type_rejected() {
        let mut bytes = Message::Reset(Reset {
            route_id: 1,
            stream_id: 2,
            trace_id: 3,
        })
        .encode();
        bytes[0] = 0x7f;
        assert!(matches!(
            Message::decode(&bytes),
            Err(Error::UnknownType(0x7f))
        ));
    }
}

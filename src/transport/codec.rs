//! Broker Wire Codec
//!
//! Text protocol spoken over the duplex link. Each operation is a control
//! line terminated by CRLF; `PUB` and `MSG` carry a length-prefixed payload.
//!
//! Client → server: `CONNECT`, `PUB`, `SUB`, `UNSUB`, `PING`, `PONG`
//! Server → client: `INFO`, `MSG`, `PING`, `PONG`, `+OK`, `-ERR`

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::error::{TransportError, TransportResult};

const CRLF: &[u8] = b"\r\n";

/// Payload limit used until the server announces its own
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Server INFO block sent when the link opens
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub max_payload: usize,
    #[serde(default)]
    pub auth_required: bool,
}

/// Client CONNECT block
#[derive(Debug, Clone, Serialize)]
pub struct ConnectInfo {
    pub verbose: bool,
    pub pedantic: bool,
    pub lang: String,
    pub version: String,
    pub protocol: u8,
    pub headers: bool,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl ConnectInfo {
    /// Build the CONNECT block for a named client
    pub fn new(name: &str) -> Self {
        Self {
            verbose: false,
            pedantic: false,
            lang: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: 1,
            headers: false,
            name: name.to_string(),
            user: None,
            pass: None,
            auth_token: None,
        }
    }
}

/// Operations sent by the client
#[derive(Debug, Clone)]
pub enum ClientOp {
    Connect(ConnectInfo),
    Pub { subject: String, payload: Bytes },
    Sub { subject: String, sid: u64 },
    Unsub { sid: u64 },
    Ping,
    Pong,
}

impl ClientOp {
    /// Encode into a wire frame
    pub fn encode(&self) -> TransportResult<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            ClientOp::Connect(info) => {
                out.extend_from_slice(b"CONNECT ");
                out.extend_from_slice(serde_json::to_string(info)?.as_bytes());
                out.extend_from_slice(CRLF);
            }
            ClientOp::Pub { subject, payload } => {
                out.extend_from_slice(format!("PUB {} {}\r\n", subject, payload.len()).as_bytes());
                out.extend_from_slice(payload);
                out.extend_from_slice(CRLF);
            }
            ClientOp::Sub { subject, sid } => {
                out.extend_from_slice(format!("SUB {} {}\r\n", subject, sid).as_bytes());
            }
            ClientOp::Unsub { sid } => {
                out.extend_from_slice(format!("UNSUB {}\r\n", sid).as_bytes());
            }
            ClientOp::Ping => out.extend_from_slice(b"PING\r\n"),
            ClientOp::Pong => out.extend_from_slice(b"PONG\r\n"),
        }
        Ok(out)
    }
}

/// Operations received from the server
#[derive(Debug, Clone)]
pub enum ServerOp {
    Info(ServerInfo),
    Msg {
        subject: String,
        sid: u64,
        reply: Option<String>,
        payload: Bytes,
    },
    Ping,
    Pong,
    Ok,
    Err(String),
}

/// Incremental decoder for server operations
///
/// Frames may split an operation or carry several; bytes are buffered
/// until a complete operation is available. A line that fails to decode
/// is consumed together with the error, so the next call moves on.
#[derive(Debug)]
pub struct Decoder {
    buf: BytesMut,
    max_payload: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self {
            buf: BytesMut::new(),
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the `max_payload` announced in INFO; zero keeps the current limit
    pub fn set_max_payload(&mut self, max_payload: usize) {
        if max_payload > 0 {
            self.max_payload = max_payload;
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Append received bytes
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Decode the next complete operation, if any
    pub fn next_op(&mut self) -> TransportResult<Option<ServerOp>> {
        let line_end = match find_crlf(&self.buf) {
            Some(pos) => pos,
            None => return Ok(None),
        };

        let result = self.decode_line(line_end);
        if result.is_err() {
            self.buf.advance(line_end + CRLF.len());
        }
        result
    }

    fn decode_line(&mut self, line_end: usize) -> TransportResult<Option<ServerOp>> {
        let line = std::str::from_utf8(&self.buf[..line_end])
            .map_err(|_| TransportError::Protocol("control line is not UTF-8".to_string()))?
            .to_string();

        let (verb, rest) = match line.split_once(' ') {
            Some((v, r)) => (v, r.trim()),
            None => (line.as_str(), ""),
        };

        let op = match verb.to_ascii_uppercase().as_str() {
            "MSG" => return self.decode_msg(rest, line_end),
            "INFO" => {
                let info: ServerInfo = serde_json::from_str(rest)
                    .map_err(|e| TransportError::Protocol(format!("bad INFO: {}", e)))?;
                ServerOp::Info(info)
            }
            "PING" => ServerOp::Ping,
            "PONG" => ServerOp::Pong,
            "+OK" => ServerOp::Ok,
            "-ERR" => ServerOp::Err(rest.trim_matches('\'').to_string()),
            other => {
                return Err(TransportError::Protocol(format!(
                    "unknown operation: {}",
                    other
                )))
            }
        };

        self.buf.advance(line_end + CRLF.len());
        Ok(Some(op))
    }

    fn decode_msg(&mut self, args: &str, line_end: usize) -> TransportResult<Option<ServerOp>> {
        let parts: Vec<&str> = args.split_whitespace().collect();
        let (subject, sid, reply, len) = match parts.as_slice() {
            [subject, sid, len] => (*subject, *sid, None, *len),
            [subject, sid, reply, len] => (*subject, *sid, Some(reply.to_string()), *len),
            _ => {
                return Err(TransportError::Protocol(format!(
                    "bad MSG arguments: {}",
                    args
                )))
            }
        };

        let sid: u64 = sid
            .parse()
            .map_err(|_| TransportError::Protocol(format!("bad sid: {}", sid)))?;
        let len: usize = len
            .parse()
            .map_err(|_| TransportError::Protocol(format!("bad payload size: {}", len)))?;

        if len > self.max_payload {
            return Err(TransportError::Protocol(format!(
                "payload of {} bytes exceeds limit of {}",
                len, self.max_payload
            )));
        }

        let payload_start = line_end + CRLF.len();
        let frame_end = payload_start
            .checked_add(len)
            .and_then(|end| end.checked_add(CRLF.len()))
            .ok_or_else(|| TransportError::Protocol(format!("bad payload size: {}", len)))?;
        if self.buf.len() < frame_end {
            return Ok(None);
        }

        let subject = subject.to_string();
        self.buf.advance(payload_start);
        let payload = self.buf.split_to(len).freeze();
        self.buf.advance(CRLF.len());

        Ok(Some(ServerOp::Msg {
            subject,
            sid,
            reply,
            payload,
        }))
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_pub() {
        let op = ClientOp::Pub {
            subject: "orders.created".to_string(),
            payload: Bytes::from_static(b"{\"id\":1}"),
        };
        let frame = op.encode().unwrap();
        assert_eq!(frame, b"PUB orders.created 8\r\n{\"id\":1}\r\n".to_vec());
    }

    #[test]
    fn test_encode_connect_with_token() {
        let mut info = ConnectInfo::new("panel");
        info.auth_token = Some("s3cret".to_string());
        let frame = String::from_utf8(ClientOp::Connect(info).encode().unwrap()).unwrap();
        assert!(frame.starts_with("CONNECT {"));
        assert!(frame.contains("\"auth_token\":\"s3cret\""));
        assert!(!frame.contains("\"user\""));
        assert!(frame.ends_with("\r\n"));
    }

    #[test]
    fn test_decode_info_and_ping() {
        let mut decoder = Decoder::new();
        decoder.push(b"INFO {\"server_id\":\"abc\",\"max_payload\":1048576}\r\nPING\r\n");

        match decoder.next_op().unwrap() {
            Some(ServerOp::Info(info)) => {
                assert_eq!(info.server_id, "abc");
                assert_eq!(info.max_payload, 1048576);
            }
            other => panic!("Expected Info, got {:?}", other),
        }
        assert!(matches!(decoder.next_op().unwrap(), Some(ServerOp::Ping)));
        assert!(decoder.next_op().unwrap().is_none());
    }

    #[test]
    fn test_decode_msg_split_across_frames() {
        let mut decoder = Decoder::new();
        decoder.push(b"MSG metrics.cpu 7 5\r\nhel");
        assert!(decoder.next_op().unwrap().is_none());

        decoder.push(b"lo\r\n");
        match decoder.next_op().unwrap() {
            Some(ServerOp::Msg {
                subject,
                sid,
                reply,
                payload,
            }) => {
                assert_eq!(subject, "metrics.cpu");
                assert_eq!(sid, 7);
                assert!(reply.is_none());
                assert_eq!(&payload[..], b"hello");
            }
            other => panic!("Expected Msg, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_msg_with_reply() {
        let mut decoder = Decoder::new();
        decoder.push(b"MSG svc.echo 2 _INBOX.1 0\r\n\r\n");
        match decoder.next_op().unwrap() {
            Some(ServerOp::Msg { reply, payload, .. }) => {
                assert_eq!(reply.as_deref(), Some("_INBOX.1"));
                assert!(payload.is_empty());
            }
            other => panic!("Expected Msg, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_err() {
        let mut decoder = Decoder::new();
        decoder.push(b"-ERR 'Authorization Violation'\r\n");
        match decoder.next_op().unwrap() {
            Some(ServerOp::Err(message)) => assert_eq!(message, "Authorization Violation"),
            other => panic!("Expected Err, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_operation() {
        let mut decoder = Decoder::new();
        decoder.push(b"BOGUS\r\n");
        assert!(matches!(
            decoder.next_op(),
            Err(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn test_bad_line_is_skipped() {
        let mut decoder = Decoder::new();
        decoder.push(b"BOGUS\r\n");
        assert!(decoder.next_op().is_err());

        decoder.push(b"PING\r\n");
        assert!(matches!(decoder.next_op().unwrap(), Some(ServerOp::Ping)));
        assert!(decoder.next_op().unwrap().is_none());
    }

    #[test]
    fn test_bad_msg_arguments_are_skipped() {
        let mut decoder = Decoder::new();
        decoder.push(b"MSG only.subject\r\nPONG\r\n");
        assert!(matches!(
            decoder.next_op(),
            Err(TransportError::Protocol(_))
        ));
        assert!(matches!(decoder.next_op().unwrap(), Some(ServerOp::Pong)));
    }

    #[test]
    fn test_huge_payload_size_is_rejected() {
        let mut decoder = Decoder::new();
        decoder.push(b"MSG a.b 1 18446744073709551615\r\nxx\r\n");
        assert!(matches!(
            decoder.next_op(),
            Err(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn test_announced_max_payload_applies() {
        let mut decoder = Decoder::new();
        decoder.set_max_payload(0);
        assert_eq!(decoder.max_payload(), DEFAULT_MAX_PAYLOAD);

        decoder.set_max_payload(4);
        decoder.push(b"MSG a.b 1 5\r\nhello\r\n");
        assert!(matches!(
            decoder.next_op(),
            Err(TransportError::Protocol(_))
        ));

        decoder.push(b"MSG a.b 1 4\r\nhell\r\n");
        // Payload of the rejected frame surfaces as one more bad line
        assert!(decoder.next_op().is_err());
        match decoder.next_op().unwrap() {
            Some(ServerOp::Msg { payload, .. }) => assert_eq!(&payload[..], b"hell"),
            other => panic!("Expected Msg, got {:?}", other),
        }
    }
}

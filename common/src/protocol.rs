use std::io;

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::{MESSAGE_BUFFER_SIZE, QUIT_COMMAND};

/// The fields the launcher itself cares about; everything else in a message
/// belongs to the backend.
#[derive(Debug, Deserialize)]
struct MessageEnvelope {
    method: Option<String>,
    id: Option<String>,
}

/// One inbound message, decoded strictly.
///
/// The wire format is UTF-8 text: either the reserved control payload `quit`,
/// or one JSON object per message carrying at least a string `method` field.
/// Anything else decodes to [`ClientMessage::Malformed`] instead of silently
/// falling through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// The reserved `quit` control payload, handled by the launcher itself.
    Quit,
    /// An `init` handshake naming the backend profile to bind to. `raw` keeps
    /// the original payload so it can be forwarded to the backend after the
    /// session binds.
    Init { id: String, raw: String },
    /// Any other structured message; forwarded verbatim once the session is
    /// bound.
    Forward { raw: String },
    /// Not UTF-8, not JSON, not an object, or missing the required fields.
    Malformed,
}

impl ClientMessage {
    /// Decode one message payload.
    pub fn decode(payload: &[u8]) -> Self {
        if payload == QUIT_COMMAND {
            return ClientMessage::Quit;
        }

        let Ok(text) = std::str::from_utf8(payload) else {
            return ClientMessage::Malformed;
        };

        let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
            return ClientMessage::Malformed;
        };
        if !value.is_object() {
            return ClientMessage::Malformed;
        }
        let Ok(envelope) = serde_json::from_value::<MessageEnvelope>(value) else {
            return ClientMessage::Malformed;
        };

        match envelope.method.as_deref() {
            Some("init") => match envelope.id {
                Some(id) => ClientMessage::Init {
                    id,
                    raw: text.to_string(),
                },
                None => ClientMessage::Malformed,
            },
            Some(_) => ClientMessage::Forward {
                raw: text.to_string(),
            },
            None => ClientMessage::Malformed,
        }
    }
}

/// Read one message with a single buffered read.
///
/// Returns `Ok(None)` on a zero-length read or end of stream, which the
/// caller treats as a disconnect. The buffer lives only for this call.
///
/// One read is assumed to deliver one complete message; the launcher protocol
/// keeps messages well under [`MESSAGE_BUFFER_SIZE`] and existing clients do
/// not length-prefix, so no framing layer is applied.
pub async fn read_message<S>(stream: &mut S) -> io::Result<Option<Vec<u8>>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; MESSAGE_BUFFER_SIZE];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    buf.truncate(n);
    Ok(Some(buf))
}

/// Write one message and flush it out to the peer.
pub async fn write_message<S>(stream: &mut S, payload: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(payload).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_quit_control_payload() {
        assert_eq!(ClientMessage::decode(b"quit"), ClientMessage::Quit);
    }

    #[test]
    fn decode_init_keeps_raw_payload() {
        let payload = r#"{"method":"init","id":"F80736AF-4502-4D8F-A684-1889C2B3BBBD"}"#;
        assert_eq!(
            ClientMessage::decode(payload.as_bytes()),
            ClientMessage::Init {
                id: "F80736AF-4502-4D8F-A684-1889C2B3BBBD".to_string(),
                raw: payload.to_string(),
            }
        );
    }

    #[test]
    fn decode_other_method_is_forwarded() {
        let payload = r#"{"method":"keyDown","keyCode":65}"#;
        assert_eq!(
            ClientMessage::decode(payload.as_bytes()),
            ClientMessage::Forward {
                raw: payload.to_string(),
            }
        );
    }

    #[test]
    fn decode_init_without_id_is_malformed() {
        let payload = r#"{"method":"init"}"#;
        assert_eq!(
            ClientMessage::decode(payload.as_bytes()),
            ClientMessage::Malformed
        );
    }

    #[test]
    fn decode_rejects_non_protocol_input() {
        assert_eq!(ClientMessage::decode(b"{oops"), ClientMessage::Malformed);
        assert_eq!(ClientMessage::decode(b"[1,2,3]"), ClientMessage::Malformed);
        assert_eq!(
            ClientMessage::decode(r#"{"no_method":true}"#.as_bytes()),
            ClientMessage::Malformed
        );
        assert_eq!(
            ClientMessage::decode(&[0xff, 0xfe, 0x00]),
            ClientMessage::Malformed
        );
    }

    #[tokio::test]
    async fn read_message_reports_disconnect_as_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_message(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_then_read_round_trips_one_message() {
        let (mut client, mut server) = tokio::io::duplex(MESSAGE_BUFFER_SIZE);
        write_message(&mut client, b"{\"method\":\"ping\"}")
            .await
            .unwrap();
        let payload = read_message(&mut server).await.unwrap().unwrap();
        assert_eq!(payload, b"{\"method\":\"ping\"}");
    }
}

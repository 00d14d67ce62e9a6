//! Client-to-daemon commands.
//!
//! Every command starts with an ASCII line terminated by `\n`. IDENTIFY,
//! PUB and MPUB follow the line with a binary block:
//!
//! ```text
//! IDENTIFY\n[4-byte size][JSON]
//! PUB <topic>\n[4-byte size][body]
//! MPUB <topic>\n[4-byte body size][4-byte count]([4-byte size][body])*
//! ```
//!
//! The MPUB body size counts the per-message size prefixes and bodies, not
//! the count field.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::identify::IdentifyConfig;
use crate::message::{MessageId, MESSAGE_ID_LENGTH};

/// Longest topic or channel name the daemon accepts.
pub const MAX_NAME_LENGTH: usize = 64;

/// Suffix marking a topic or channel as ephemeral.
const EPHEMERAL_SUFFIX: &str = "#ephemeral";

/// A command sent from the client to the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Handshake metadata.
    Identify(IdentifyConfig),
    /// Subscribe to a topic/channel pair.
    Sub {
        /// Topic name.
        topic: String,
        /// Channel name.
        channel: String,
    },
    /// Grant the daemon credit for this many in-flight messages.
    Rdy(u64),
    /// Mark a message as successfully processed.
    Fin(MessageId),
    /// Return a message to the queue after a delay.
    Req {
        /// Message to requeue.
        id: MessageId,
        /// Redelivery delay in milliseconds; 0 redelivers immediately.
        timeout_ms: u64,
    },
    /// Reset the daemon-side timeout of an in-flight message.
    Touch(MessageId),
    /// Ask the daemon to stop sending messages before closing.
    Cls,
    /// No-op, used to answer heartbeats.
    Nop,
    /// Publish a single message.
    Pub {
        /// Topic name.
        topic: String,
        /// Message body.
        body: Bytes,
    },
    /// Publish several messages atomically.
    Mpub {
        /// Topic name.
        topic: String,
        /// Message bodies, in order.
        bodies: Vec<Bytes>,
    },
}

impl Command {
    /// Build a validated SUB command.
    pub fn sub(topic: impl Into<String>, channel: impl Into<String>) -> Result<Self> {
        let topic = topic.into();
        let channel = channel.into();
        validate_topic_name(&topic)?;
        validate_channel_name(&channel)?;
        Ok(Command::Sub { topic, channel })
    }

    /// Build a validated PUB command.
    pub fn publish(topic: impl Into<String>, body: impl Into<Bytes>) -> Result<Self> {
        let topic = topic.into();
        validate_topic_name(&topic)?;
        Ok(Command::Pub {
            topic,
            body: body.into(),
        })
    }

    /// Build a validated MPUB command.
    pub fn multi_publish(topic: impl Into<String>, bodies: Vec<Bytes>) -> Result<Self> {
        let topic = topic.into();
        validate_topic_name(&topic)?;
        if bodies.is_empty() {
            return Err(ProtocolError::EmptyBatch);
        }
        Ok(Command::Mpub { topic, bodies })
    }

    /// Command keyword, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Identify(_) => "IDENTIFY",
            Command::Sub { .. } => "SUB",
            Command::Rdy(_) => "RDY",
            Command::Fin(_) => "FIN",
            Command::Req { .. } => "REQ",
            Command::Touch(_) => "TOUCH",
            Command::Cls => "CLS",
            Command::Nop => "NOP",
            Command::Pub { .. } => "PUB",
            Command::Mpub { .. } => "MPUB",
        }
    }

    /// Encode the command into its wire form.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            Command::Identify(config) => {
                let json = config.to_json()?;
                buf.put_slice(b"IDENTIFY\n");
                put_len(&mut buf, json.len())?;
                buf.put_slice(&json);
            }
            Command::Sub { topic, channel } => {
                buf.put_slice(format!("SUB {} {}\n", topic, channel).as_bytes());
            }
            Command::Rdy(count) => {
                buf.put_slice(format!("RDY {}\n", count).as_bytes());
            }
            Command::Fin(id) => {
                buf.put_slice(b"FIN ");
                buf.put_slice(id.as_bytes());
                buf.put_u8(b'\n');
            }
            Command::Req { id, timeout_ms } => {
                buf.put_slice(b"REQ ");
                buf.put_slice(id.as_bytes());
                buf.put_slice(format!(" {}\n", timeout_ms).as_bytes());
            }
            Command::Touch(id) => {
                buf.put_slice(b"TOUCH ");
                buf.put_slice(id.as_bytes());
                buf.put_u8(b'\n');
            }
            Command::Cls => buf.put_slice(b"CLS\n"),
            Command::Nop => buf.put_slice(b"NOP\n"),
            Command::Pub { topic, body } => {
                buf.put_slice(format!("PUB {}\n", topic).as_bytes());
                put_len(&mut buf, body.len())?;
                buf.put_slice(body);
            }
            Command::Mpub { topic, bodies } => {
                let body_size: usize = bodies.iter().map(|b| 4 + b.len()).sum();
                buf.put_slice(format!("MPUB {}\n", topic).as_bytes());
                put_len(&mut buf, body_size)?;
                put_len(&mut buf, bodies.len())?;
                for body in bodies {
                    put_len(&mut buf, body.len())?;
                    buf.put_slice(body);
                }
            }
        }
        Ok(buf.freeze())
    }

    /// Try to parse one command from the front of `data`.
    ///
    /// Returns the command and the number of bytes consumed, or `None` if
    /// more bytes are needed.
    pub fn try_decode(data: &[u8]) -> Result<Option<(Command, usize)>> {
        let Some(line_end) = data.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let line = &data[..line_end];
        let rest = &data[line_end + 1..];
        let line_len = line_end + 1;

        let (name, args) = match line.iter().position(|&b| b == b' ') {
            Some(space) => (&line[..space], &line[space + 1..]),
            None => (line, &line[line.len()..]),
        };

        let decoded = match name {
            b"IDENTIFY" => read_block(rest)?.map(|(json, used)| -> Result<_> {
                let config: IdentifyConfig = serde_json::from_slice(json)?;
                Ok((Command::Identify(config), line_len + used))
            }),
            b"SUB" => {
                let args = text(args)?;
                let mut parts = args.split(' ');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(topic), Some(channel), None) => Some(Ok((
                        Command::Sub {
                            topic: topic.to_string(),
                            channel: channel.to_string(),
                        },
                        line_len,
                    ))),
                    _ => return Err(malformed("SUB", args)),
                }
            }
            b"RDY" => {
                let count = text(args)?
                    .parse::<u64>()
                    .map_err(|e| ProtocolError::MalformedCommand(format!("RDY: {}", e)))?;
                Some(Ok((Command::Rdy(count), line_len)))
            }
            b"FIN" => Some(Ok((Command::Fin(MessageId::from_slice(args)?), line_len))),
            b"TOUCH" => Some(Ok((Command::Touch(MessageId::from_slice(args)?), line_len))),
            b"REQ" => {
                if args.len() < MESSAGE_ID_LENGTH + 2 || args[MESSAGE_ID_LENGTH] != b' ' {
                    return Err(malformed("REQ", &String::from_utf8_lossy(args)));
                }
                let id = MessageId::from_slice(&args[..MESSAGE_ID_LENGTH])?;
                let timeout_ms = text(&args[MESSAGE_ID_LENGTH + 1..])?
                    .parse::<u64>()
                    .map_err(|e| ProtocolError::MalformedCommand(format!("REQ: {}", e)))?;
                Some(Ok((Command::Req { id, timeout_ms }, line_len)))
            }
            b"CLS" => Some(Ok((Command::Cls, line_len))),
            b"NOP" => Some(Ok((Command::Nop, line_len))),
            b"PUB" => {
                let topic = text(args)?.to_string();
                read_block(rest)?.map(|(body, used)| {
                    Ok((
                        Command::Pub {
                            topic,
                            body: Bytes::copy_from_slice(body),
                        },
                        line_len + used,
                    ))
                })
            }
            b"MPUB" => {
                let topic = text(args)?.to_string();
                match read_mpub(rest)? {
                    Some((bodies, used)) => {
                        Some(Ok((Command::Mpub { topic, bodies }, line_len + used)))
                    }
                    None => None,
                }
            }
            other => {
                return Err(malformed(
                    "command",
                    &String::from_utf8_lossy(other).into_owned(),
                ))
            }
        };

        decoded.transpose()
    }
}

/// Validate a topic name against the daemon's naming rules.
pub fn validate_topic_name(name: &str) -> Result<()> {
    validate_name("topic", name)
}

/// Validate a channel name against the daemon's naming rules.
pub fn validate_channel_name(name: &str) -> Result<()> {
    validate_name("channel", name)
}

fn validate_name(kind: &'static str, name: &str) -> Result<()> {
    let base = name.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(name);
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LENGTH
        && !base.is_empty()
        && base
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(ProtocolError::InvalidName {
            kind,
            name: name.to_string(),
        })
    }
}

fn put_len(buf: &mut BytesMut, len: usize) -> Result<()> {
    let len = u32::try_from(len)
        .ok()
        .filter(|l| *l <= i32::MAX as u32)
        .ok_or(ProtocolError::FrameTooLarge {
            size: len,
            max: i32::MAX as usize,
        })?;
    buf.put_u32(len);
    Ok(())
}

fn read_len(data: &[u8]) -> Option<usize> {
    let bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes) as usize)
}

/// Reads a `[4-byte size][bytes]` block, returning the bytes and total consumed.
fn read_block(data: &[u8]) -> Result<Option<(&[u8], usize)>> {
    let Some(len) = read_len(data) else {
        return Ok(None);
    };
    if data.len() < 4 + len {
        return Ok(None);
    }
    Ok(Some((&data[4..4 + len], 4 + len)))
}

fn read_mpub(data: &[u8]) -> Result<Option<(Vec<Bytes>, usize)>> {
    let (Some(body_size), Some(count)) = (read_len(data), data.get(4..).and_then(read_len))
    else {
        return Ok(None);
    };
    let total = 8 + body_size;
    if data.len() < total {
        return Ok(None);
    }

    let mut bodies = Vec::with_capacity(count);
    let mut cursor = &data[8..total];
    for _ in 0..count {
        match read_block(cursor)? {
            Some((body, used)) => {
                bodies.push(Bytes::copy_from_slice(body));
                cursor = &cursor[used..];
            }
            None => return Err(malformed("MPUB", "body shorter than declared")),
        }
    }
    if !cursor.is_empty() {
        return Err(malformed("MPUB", "trailing bytes after declared messages"));
    }
    Ok(Some((bodies, total)))
}

fn text(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes)
        .map_err(|e| ProtocolError::MalformedCommand(format!("non-utf8 arguments: {}", e)))
}

fn malformed(what: &str, detail: &str) -> ProtocolError {
    ProtocolError::MalformedCommand(format!("{}: {}", what, detail))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> MessageId {
        MessageId::new(*b"06a1b2c3d4e5f607")
    }

    #[test]
    fn test_encode_text_commands() {
        let cases: Vec<(Command, &str)> = vec![
            (Command::sub("orders", "billing").unwrap(), "SUB orders billing\n"),
            (Command::Rdy(10), "RDY 10\n"),
            (Command::Fin(id()), "FIN 06a1b2c3d4e5f607\n"),
            (
                Command::Req {
                    id: id(),
                    timeout_ms: 0,
                },
                "REQ 06a1b2c3d4e5f607 0\n",
            ),
            (Command::Touch(id()), "TOUCH 06a1b2c3d4e5f607\n"),
            (Command::Cls, "CLS\n"),
            (Command::Nop, "NOP\n"),
        ];
        for (command, expected) in cases {
            assert_eq!(
                &command.encode().unwrap()[..],
                expected.as_bytes(),
                "{}",
                command.name()
            );
        }
    }

    #[test]
    fn test_encode_pub() {
        let encoded = Command::publish("t", "hello").unwrap().encode().unwrap();
        let mut expected = b"PUB t\n".to_vec();
        expected.extend_from_slice(&5u32.to_be_bytes());
        expected.extend_from_slice(b"hello");
        assert_eq!(&encoded[..], &expected[..]);
    }

    #[test]
    fn test_encode_mpub() {
        let bodies = vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cde")];
        let encoded = Command::multi_publish("t", bodies)
            .unwrap()
            .encode()
            .unwrap();

        let mut expected = b"MPUB t\n".to_vec();
        expected.extend_from_slice(&13u32.to_be_bytes()); // (4 + 2) + (4 + 3)
        expected.extend_from_slice(&2u32.to_be_bytes());
        expected.extend_from_slice(&2u32.to_be_bytes());
        expected.extend_from_slice(b"ab");
        expected.extend_from_slice(&3u32.to_be_bytes());
        expected.extend_from_slice(b"cde");
        assert_eq!(&encoded[..], &expected[..]);
    }

    #[test]
    fn test_encode_identify() {
        let config = IdentifyConfig::new("127.0.0.1", "host", "agent");
        let encoded = Command::Identify(config.clone()).encode().unwrap();

        assert!(encoded.starts_with(b"IDENTIFY\n"));
        let len = u32::from_be_bytes(encoded[9..13].try_into().unwrap()) as usize;
        assert_eq!(len, encoded.len() - 13);
        let parsed: IdentifyConfig = serde_json::from_slice(&encoded[13..]).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_empty_batch_rejected() {
        assert!(matches!(
            Command::multi_publish("t", vec![]),
            Err(ProtocolError::EmptyBatch)
        ));
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_topic_name("orders").is_ok());
        assert!(validate_topic_name("a.b_c-d").is_ok());
        assert!(validate_channel_name("tail#ephemeral").is_ok());
        assert!(validate_topic_name(&"x".repeat(64)).is_ok());

        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("#ephemeral").is_err());
        assert!(validate_topic_name("has space").is_err());
        assert!(validate_topic_name("new\nline").is_err());
        assert!(validate_topic_name(&"x".repeat(65)).is_err());
        assert!(Command::sub("ok", "bad channel").is_err());
        assert!(Command::publish("bad/topic", "x").is_err());
    }

    #[test]
    fn test_decode_inverts_encode() {
        let commands = vec![
            Command::Identify(IdentifyConfig::new("c", "h", "ua")),
            Command::sub("t", "c").unwrap(),
            Command::Rdy(42),
            Command::Fin(id()),
            Command::Req {
                id: id(),
                timeout_ms: 1500,
            },
            Command::Touch(id()),
            Command::Cls,
            Command::Nop,
            Command::publish("t", "hello").unwrap(),
            Command::multi_publish("t", vec![Bytes::from_static(b"1"), Bytes::new()]).unwrap(),
        ];

        let mut stream = Vec::new();
        for command in &commands {
            stream.extend_from_slice(&command.encode().unwrap());
        }

        let mut offset = 0;
        for expected in &commands {
            let (decoded, used) = Command::try_decode(&stream[offset..]).unwrap().unwrap();
            assert_eq!(&decoded, expected);
            offset += used;
        }
        assert_eq!(offset, stream.len());
    }

    #[test]
    fn test_decode_needs_more_bytes() {
        let encoded = Command::publish("t", "hello").unwrap().encode().unwrap();
        for i in 0..encoded.len() {
            assert!(Command::try_decode(&encoded[..i]).unwrap().is_none());
        }
    }

    #[test]
    fn test_decode_unknown_command() {
        assert!(matches!(
            Command::try_decode(b"BOGUS\n"),
            Err(ProtocolError::MalformedCommand(_))
        ));
    }
}

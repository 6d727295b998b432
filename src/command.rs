//! Session-level commands exchanged with a broker.
//!
//! Only the commands needed to establish and supervise a session live here;
//! data-path commands belong to the producer/consumer layers.
//!
//! ```text
//! +--------+--------+--------+--------+
//! |        Body size (u32, BE)        |  (4 bytes)
//! +--------+--------+--------+--------+
//! |  Type  |  Fields ...              |  (body size bytes)
//! +--------+--------+--------+--------+
//! ```
//!
//! Strings are u16-length-prefixed UTF-8, blobs are u32-length-prefixed.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Protocol version advertised in `Connect`.
pub const PROTOCOL_VERSION: u32 = 21;

/// Size of the frame length prefix in bytes.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Default upper bound for a frame body (5 MiB payload plus headroom).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 5 * 1024 * 1024 + 10 * 1024;

/// Command type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandType {
    /// Client session request.
    Connect = 0x01,
    /// Broker accepted the session.
    Connected = 0x02,
    /// Broker rejected a request.
    Error = 0x03,
    /// Keep-alive ping.
    Ping = 0x04,
    /// Keep-alive answer.
    Pong = 0x05,
}

impl CommandType {
    /// Create a CommandType from a raw byte value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Connect),
            0x02 => Some(Self::Connected),
            0x03 => Some(Self::Error),
            0x04 => Some(Self::Ping),
            0x05 => Some(Self::Pong),
            _ => None,
        }
    }
}

/// A decoded command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Opens a session.
    Connect {
        client_version: String,
        protocol_version: u32,
        auth_method: String,
        auth_data: Bytes,
        /// Logical broker address when dialing through a proxy.
        proxy_to_broker_url: Option<String>,
    },
    /// Session accepted.
    Connected {
        server_version: String,
        protocol_version: u32,
        max_message_size: u32,
    },
    /// Request rejected.
    Error { code: u16, message: String },
    /// Keep-alive ping.
    Ping,
    /// Keep-alive answer.
    Pong,
}

impl Command {
    /// The type tag of this command.
    pub fn command_type(&self) -> CommandType {
        match self {
            Self::Connect { .. } => CommandType::Connect,
            Self::Connected { .. } => CommandType::Connected,
            Self::Error { .. } => CommandType::Error,
            Self::Ping => CommandType::Ping,
            Self::Pong => CommandType::Pong,
        }
    }

    /// Encode into a complete frame, length prefix included.
    ///
    /// Fails if a string field does not fit its u16 length prefix.
    pub fn to_frame(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32(0);
        buf.put_u8(self.command_type() as u8);

        match self {
            Self::Connect {
                client_version,
                protocol_version,
                auth_method,
                auth_data,
                proxy_to_broker_url,
            } => {
                put_string(&mut buf, client_version)?;
                buf.put_u32(*protocol_version);
                put_string(&mut buf, auth_method)?;
                buf.put_u32(auth_data.len() as u32);
                buf.put_slice(auth_data);
                match proxy_to_broker_url {
                    Some(url) => {
                        buf.put_u8(1);
                        put_string(&mut buf, url)?;
                    }
                    None => buf.put_u8(0),
                }
            }
            Self::Connected {
                server_version,
                protocol_version,
                max_message_size,
            } => {
                put_string(&mut buf, server_version)?;
                buf.put_u32(*protocol_version);
                buf.put_u32(*max_message_size);
            }
            Self::Error { code, message } => {
                buf.put_u16(*code);
                put_string(&mut buf, message)?;
            }
            Self::Ping | Self::Pong => {}
        }

        let body_len = (buf.len() - FRAME_HEADER_SIZE) as u32;
        buf[..FRAME_HEADER_SIZE].copy_from_slice(&body_len.to_be_bytes());
        Ok(buf.freeze())
    }

    /// Decode a frame body (length prefix already stripped).
    pub fn decode(mut body: Bytes) -> Result<Self> {
        ensure(&body, 1)?;
        let raw_type = body.get_u8();
        let command_type = CommandType::from_u8(raw_type)
            .ok_or_else(|| Error::malformed(format!("unknown command type 0x{raw_type:02X}")))?;

        let command = match command_type {
            CommandType::Connect => {
                let client_version = get_string(&mut body)?;
                ensure(&body, 4)?;
                let protocol_version = body.get_u32();
                let auth_method = get_string(&mut body)?;
                ensure(&body, 4)?;
                let auth_len = body.get_u32() as usize;
                ensure(&body, auth_len)?;
                let auth_data = body.split_to(auth_len);
                ensure(&body, 1)?;
                let proxy_to_broker_url = match body.get_u8() {
                    0 => None,
                    _ => Some(get_string(&mut body)?),
                };
                Self::Connect {
                    client_version,
                    protocol_version,
                    auth_method,
                    auth_data,
                    proxy_to_broker_url,
                }
            }
            CommandType::Connected => {
                let server_version = get_string(&mut body)?;
                ensure(&body, 8)?;
                Self::Connected {
                    server_version,
                    protocol_version: body.get_u32(),
                    max_message_size: body.get_u32(),
                }
            }
            CommandType::Error => {
                ensure(&body, 2)?;
                let code = body.get_u16();
                Self::Error {
                    code,
                    message: get_string(&mut body)?,
                }
            }
            CommandType::Ping => Self::Ping,
            CommandType::Pong => Self::Pong,
        };

        if body.has_remaining() {
            return Err(Error::malformed(format!(
                "{} trailing bytes after {:?}",
                body.remaining(),
                command_type
            )));
        }
        Ok(command)
    }
}

fn ensure(buf: &Bytes, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(Error::malformed(format!(
            "truncated command: need {needed} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn put_string(buf: &mut BytesMut, value: &str) -> Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| {
        Error::malformed(format!(
            "string of {} bytes exceeds the {} byte limit",
            value.len(),
            u16::MAX
        ))
    })?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn get_string(buf: &mut Bytes) -> Result<String> {
    ensure(buf, 2)?;
    let len = buf.get_u16() as usize;
    ensure(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| Error::malformed("string is not valid UTF-8"))
}

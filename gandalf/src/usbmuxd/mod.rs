// Jackson Coxson
// Client for the mux control socket: framing, requests, and the device
// plug event subscription

use std::net::{AddrParseError, SocketAddr};
use std::str::FromStr;

use plist::Dictionary;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

use crate::{GandalfError, ReadWrite};

mod des;
mod raw_packet;

pub use raw_packet::{FrameHeader, RawPacket};

const CLIENT_VERSION: &str = concat!("gandalf ", env!("CARGO_PKG_VERSION"));
const PROG_NAME: &str = "gandalf";

/// Where the mux control socket lives.
#[derive(Debug, Clone)]
pub enum UsbmuxdAddr {
    UnixSocket(String),
    TcpSocket(SocketAddr),
}

impl UsbmuxdAddr {
    pub const SOCKET_FILE: &'static str = "/var/run/usbmuxd";

    pub fn from_env_var() -> Result<Self, AddrParseError> {
        Ok(match std::env::var("USBMUXD_SOCKET_ADDRESS") {
            Ok(var) => {
                if var.contains(':') {
                    Self::TcpSocket(SocketAddr::from_str(&var)?)
                } else {
                    Self::UnixSocket(var)
                }
            }
            Err(_) => Self::default(),
        })
    }

    /// Opens a fresh connection to the mux. Connection refusal maps to
    /// the typed unreachable error so callers can exit accordingly.
    pub async fn connect(&self, tag: u32) -> Result<UsbmuxdConnection, GandalfError> {
        let socket: Box<dyn ReadWrite> = match self {
            Self::UnixSocket(path) => match UnixStream::connect(path).await {
                Ok(socket) => Box::new(socket),
                Err(e) => return Err(Self::classify_connect_error(e, path)),
            },
            Self::TcpSocket(addr) => match TcpStream::connect(addr).await {
                Ok(socket) => Box::new(socket),
                Err(e) => return Err(Self::classify_connect_error(e, &addr.to_string())),
            },
        };
        Ok(UsbmuxdConnection::new(socket, tag))
    }

    fn classify_connect_error(e: std::io::Error, addr: &str) -> GandalfError {
        match e.kind() {
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound => {
                GandalfError::MuxUnreachable(addr.to_string())
            }
            _ => GandalfError::Socket(e),
        }
    }
}

impl Default for UsbmuxdAddr {
    fn default() -> Self {
        Self::UnixSocket(Self::SOCKET_FILE.to_string())
    }
}

/// Decoded `Number` field of a mux `Result` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Success,
    MalformedRequest,
    DeviceNotConnected,
    PortNotAvailable,
    Unknown(u64),
}

impl ReplyCode {
    pub fn from_number(number: u64) -> Self {
        match number {
            0 => Self::Success,
            1 => Self::MalformedRequest,
            2 => Self::DeviceNotConnected,
            3 => Self::PortNotAvailable,
            n => Self::Unknown(n),
        }
    }

    fn into_error(self) -> GandalfError {
        match self {
            Self::Success => GandalfError::UnexpectedReply,
            Self::MalformedRequest => GandalfError::MalformedRequest,
            Self::DeviceNotConnected => GandalfError::DeviceNotConnected,
            Self::PortNotAvailable => GandalfError::PortNotAvailable,
            Self::Unknown(n) => GandalfError::UnknownReplyCode(n),
        }
    }
}

/// Properties the mux reports alongside an `Attached` event.
#[derive(Debug, Clone)]
pub struct DeviceProperties {
    pub connection_speed: Option<u64>,
    pub connection_type: String,
    pub location_id: Option<u64>,
    pub product_id: Option<u64>,
    pub serial_number: String,
}

/// One device plug event from the subscription stream.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Attached {
        device_id: u32,
        properties: DeviceProperties,
    },
    Detached {
        device_id: u32,
    },
}

pub struct UsbmuxdConnection {
    socket: Box<dyn ReadWrite>,
    tag: u32,
}

impl UsbmuxdConnection {
    pub const BINARY_PLIST_VERSION: u32 = 0;
    pub const XML_PLIST_VERSION: u32 = 1;

    pub const RESULT_MESSAGE_TYPE: u32 = 1;
    pub const PLIST_MESSAGE_TYPE: u32 = 8;

    pub fn new(socket: Box<dyn ReadWrite>, tag: u32) -> Self {
        Self { socket, tag }
    }

    /// Turns this connection into a device plug subscription. The mux
    /// replays every currently attached device as an `Attached` event
    /// right after acknowledging.
    pub async fn listen(&mut self) -> Result<(), GandalfError> {
        let mut req = Dictionary::new();
        req.insert("MessageType".into(), "Listen".into());
        req.insert("ClientVersionString".into(), CLIENT_VERSION.into());
        req.insert("ProgName".into(), PROG_NAME.into());
        req.insert("kLibUSBMuxVersion".into(), 3.into());
        self.write_plist(req).await?;

        match self.read_reply_code().await? {
            ReplyCode::Success => Ok(()),
            reply => Err(reply.into_error()),
        }
    }

    /// Reads the next plug event off a subscription. `Paired` messages
    /// are skipped; anything else unknown surfaces as an error.
    pub async fn next_event(&mut self) -> Result<DeviceEvent, GandalfError> {
        loop {
            let res = self.read_plist().await?;
            match res.get("MessageType").and_then(|x| x.as_string()) {
                Some("Attached") => {
                    let res = plist::to_value(&res)?;
                    let msg = plist::from_value::<des::AttachedMessage>(&res)?;
                    return Ok(DeviceEvent::Attached {
                        device_id: msg.device_id,
                        properties: DeviceProperties {
                            connection_speed: msg.properties.connection_speed,
                            connection_type: msg.properties.connection_type,
                            location_id: msg.properties.location_id,
                            product_id: msg.properties.product_id,
                            serial_number: msg.properties.serial_number,
                        },
                    });
                }
                Some("Detached") => {
                    let res = plist::to_value(&res)?;
                    let msg = plist::from_value::<des::DetachedMessage>(&res)?;
                    return Ok(DeviceEvent::Detached {
                        device_id: msg.device_id,
                    });
                }
                Some("Paired") => {
                    debug!("Skipping pairing message");
                    continue;
                }
                Some(other) => return Err(GandalfError::UnknownReply(other.to_string())),
                None => return Err(GandalfError::UnexpectedReply),
            }
        }
    }

    /// Asks the mux to connect this socket through to `port` on the
    /// device. On success the same socket is the data path; everything
    /// else closes it.
    pub async fn connect_to_device(
        mut self,
        device_id: u32,
        port: u16,
    ) -> Result<Box<dyn ReadWrite>, GandalfError> {
        debug!("Connecting to device {device_id} on port {port}");
        // The mux passes the port through as if it were already big
        // endian, so it gets swapped before serialization.
        let port = port.to_be();

        let mut req = Dictionary::new();
        req.insert("MessageType".into(), "Connect".into());
        req.insert("ClientVersionString".into(), CLIENT_VERSION.into());
        req.insert("ProgName".into(), PROG_NAME.into());
        req.insert("DeviceID".into(), device_id.into());
        req.insert("PortNumber".into(), port.into());
        self.write_plist(req).await?;

        match self.read_reply_code().await? {
            ReplyCode::Success => Ok(self.socket),
            reply => Err(reply.into_error()),
        }
    }

    async fn read_reply_code(&mut self) -> Result<ReplyCode, GandalfError> {
        let res = self.read_plist().await?;
        let res = plist::to_value(&res)?;
        match plist::from_value::<des::ResultMessage>(&res) {
            Ok(msg) => Ok(ReplyCode::from_number(msg.number)),
            Err(_) => Err(GandalfError::UnexpectedReply),
        }
    }

    async fn write_plist(&mut self, req: Dictionary) -> Result<(), GandalfError> {
        let raw = RawPacket::new(
            req,
            Self::XML_PLIST_VERSION,
            Self::PLIST_MESSAGE_TYPE,
            self.tag,
        );
        self.socket.write_all(&raw.to_bytes()?).await?;
        Ok(())
    }

    async fn read_plist(&mut self) -> Result<Dictionary, GandalfError> {
        let mut header_buffer = [0; 16];
        self.socket.read_exact(&mut header_buffer).await?;

        let header = FrameHeader::parse(&header_buffer);
        let payload_size = header
            .payload_size()
            .ok_or(GandalfError::UnexpectedReply)?;
        debug!("Reading {payload_size} bytes from muxer");
        if payload_size == 0 {
            return Ok(Dictionary::new());
        }

        let mut body_buffer = vec![0; payload_size as usize];
        self.socket.read_exact(&mut body_buffer).await?;

        let res = plist::from_bytes(&body_buffer)?;
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_number_survives_two_swaps() {
        let port: u16 = 2222;
        let mut req = Dictionary::new();
        req.insert("MessageType".into(), "Connect".into());
        req.insert("DeviceID".into(), 7u32.into());
        req.insert("PortNumber".into(), port.to_be().into());

        let bytes = RawPacket::new(req, 1, 8, 1).to_bytes().unwrap();
        let decoded: Dictionary = plist::from_bytes(&bytes[16..]).unwrap();

        let wire = decoded
            .get("PortNumber")
            .and_then(|x| x.as_unsigned_integer())
            .unwrap();
        assert_eq!(u16::from_be(wire as u16), port);
    }

    #[test]
    fn reply_codes_decode() {
        assert_eq!(ReplyCode::from_number(0), ReplyCode::Success);
        assert_eq!(ReplyCode::from_number(1), ReplyCode::MalformedRequest);
        assert_eq!(ReplyCode::from_number(2), ReplyCode::DeviceNotConnected);
        assert_eq!(ReplyCode::from_number(3), ReplyCode::PortNotAvailable);
        assert_eq!(ReplyCode::from_number(42), ReplyCode::Unknown(42));
    }

    #[tokio::test]
    async fn short_frame_surfaces_eof() {
        let (client, mut server) = tokio::io::duplex(1024);

        // Header promising more payload than will ever arrive.
        let mut frame = Vec::new();
        frame.extend_from_slice(&64u32.to_le_bytes());
        frame.extend_from_slice(&1u32.to_le_bytes());
        frame.extend_from_slice(&8u32.to_le_bytes());
        frame.extend_from_slice(&1u32.to_le_bytes());
        server.write_all(&frame).await.unwrap();
        drop(server);

        let mut conn = UsbmuxdConnection::new(Box::new(client), 1);
        match conn.read_plist().await {
            Err(GandalfError::Socket(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof)
            }
            other => panic!("expected eof error, got {other:?}"),
        }
    }
}

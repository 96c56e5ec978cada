// Jackson Coxson

use plist::Dictionary;

/// Bytes of the fixed frame header: four little-endian u32s.
pub(crate) const HEADER_SIZE: u32 = 16;

/// One framed mux message: the 16 byte header followed by an XML plist
/// payload.
#[derive(Debug)]
pub struct RawPacket {
    pub version: u32,
    pub message: u32,
    pub tag: u32,
    pub plist: Dictionary,
}

impl RawPacket {
    pub fn new(plist: Dictionary, version: u32, message: u32, tag: u32) -> Self {
        Self {
            version,
            message,
            tag,
            plist,
        }
    }

    /// Serializes the packet for the wire. The declared size covers the
    /// header itself.
    pub fn to_bytes(&self) -> Result<Vec<u8>, plist::Error> {
        let mut payload = Vec::new();
        plist::Value::Dictionary(self.plist.clone()).to_writer_xml(&mut payload)?;

        let size = payload.len() as u32 + HEADER_SIZE;
        let mut buf = Vec::with_capacity(size as usize);
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.message.to_le_bytes());
        buf.extend_from_slice(&self.tag.to_le_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }
}

/// The decoded fixed header of an incoming frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub size: u32,
    pub version: u32,
    pub message: u32,
    pub tag: u32,
}

impl FrameHeader {
    pub fn parse(buf: &[u8; 16]) -> Self {
        // We are safe to unwrap as it only panics if the slice isn't 4
        Self {
            size: u32::from_le_bytes(buf[..4].try_into().unwrap()),
            version: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            message: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            tag: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        }
    }

    /// Payload length declared by the header, or `None` when the declared
    /// size doesn't even cover the header.
    pub fn payload_size(&self) -> Option<u32> {
        self.size.checked_sub(HEADER_SIZE)
    }
}

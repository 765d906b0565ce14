//! Fixed-size bulk framing records
//!
//! Trigger 5 prefixes every bulk transfer with a 20-byte checksummed header
//! that declares the payload length out of band. Trigger 6 uses a 32-byte
//! selector record that names the session the following bytes belong to.
//!
//! Trigger 5 header layout (little-endian words):
//! ```text
//! 0      magic (0xFB)
//! 1      header length (0x14)
//! 2..4   frame info: counter[0:12) pixel format[12:14) compression[14] unknown[15]
//! 4..12  h offset, v offset, width, height: value[0:13) unknown[13:16)
//! 12..16 payload info: length[0:28) flags[28:32)
//! 16     other flags (bit0 set)
//! 17..19 unknown
//! 19     checksum
//! ```

use serde::{Deserialize, Serialize};

use crate::checksum::checksum;

/// First byte of every Trigger 5 bulk header
pub const T5_MAGIC: u8 = 0xFB;
/// Size of the Trigger 5 bulk header, also stored in its second byte
pub const T5_HEADER_LEN: usize = 20;
/// Size of the Trigger 6 selector record
pub const T6_SELECTOR_LEN: usize = 32;

const FRAME_COUNTER_MASK: u16 = 0x0FFF;
const PIXEL_FORMAT_SHIFT: u16 = 12;
const PIXEL_FORMAT_MASK: u16 = 0x3;
const COMPRESSION_BIT: u16 = 1 << 14;
const COORD_MASK: u16 = 0x1FFF;
const PAYLOAD_LEN_MASK: u32 = 0x0FFF_FFFF;
const PAYLOAD_FLAGS_SHIFT: u32 = 28;

const PAYLOAD_FLAGS_CURSOR_ENABLE: u8 = 0x3;
const PAYLOAD_FLAGS_CURSOR_DISABLE: u8 = 0x5;

#[inline]
fn le_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

#[inline]
fn le_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Pixel bit depth carried in the Trigger 5 frame-info word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 24 bits per pixel
    Rgb24,
    /// 32 bits per pixel
    Rgb32,
    /// 16 bits per pixel
    Rgb16,
    /// Reserved encoding
    Unknown(u8),
}

impl PixelFormat {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Self::Rgb24,
            1 => Self::Rgb32,
            2 => Self::Rgb16,
            other => Self::Unknown(other),
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            Self::Rgb24 => 0,
            Self::Rgb32 => 1,
            Self::Rgb16 => 2,
            Self::Unknown(bits) => bits & PIXEL_FORMAT_MASK as u8,
        }
    }

    /// Bits per pixel, if known
    pub fn bits_per_pixel(self) -> Option<u32> {
        match self {
            Self::Rgb24 => Some(24),
            Self::Rgb32 => Some(32),
            Self::Rgb16 => Some(16),
            Self::Unknown(_) => None,
        }
    }
}

/// Cursor command encoded in the payload-info flag nibble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CursorCommand {
    /// Show the hardware cursor
    Enable,
    /// Hide the hardware cursor
    Disable,
}

/// Trigger 5 bulk packet header
///
/// Multi-bit words are kept raw so unknown bits survive; accessors extract
/// the documented fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRecord {
    /// Magic byte, always [`T5_MAGIC`] for parsed headers
    pub magic: u8,
    /// Header length byte, always 20 for parsed headers
    pub header_len: u8,
    /// Frame counter, pixel format and compression flag
    pub frame_info: u16,
    /// Horizontal offset word
    pub h_offset_word: u16,
    /// Vertical offset word
    pub v_offset_word: u16,
    /// Width word
    pub width_word: u16,
    /// Height word
    pub height_word: u16,
    /// Payload length and flag nibble
    pub payload_info: u32,
    /// Other flags, bit0 is expected to be set
    pub other_flags: u8,
    /// Unknown trailing bytes
    pub unknown: [u8; 2],
    /// Checksum byte as seen on the wire
    pub checksum: u8,
}

impl HeaderRecord {
    /// Build a video image header with a correct checksum
    pub fn image(frame_counter: u16, width: u16, height: u16, payload_len: u32) -> Self {
        let mut record = Self {
            magic: T5_MAGIC,
            header_len: T5_HEADER_LEN as u8,
            frame_info: frame_counter & FRAME_COUNTER_MASK,
            h_offset_word: 0,
            v_offset_word: 0,
            width_word: width & COORD_MASK,
            height_word: height & COORD_MASK,
            payload_info: payload_len & PAYLOAD_LEN_MASK,
            other_flags: 0x01,
            unknown: [0, 0],
            checksum: 0,
        };
        record.seal();
        record
    }

    /// Set the pixel format bits and recompute the checksum
    pub fn with_pixel_format(mut self, format: PixelFormat) -> Self {
        self.frame_info &= !(PIXEL_FORMAT_MASK << PIXEL_FORMAT_SHIFT);
        self.frame_info |= u16::from(format.to_bits()) << PIXEL_FORMAT_SHIFT;
        self.seal();
        self
    }

    /// Set the payload flag nibble and recompute the checksum
    pub fn with_payload_flags(mut self, flags: u8) -> Self {
        self.payload_info &= PAYLOAD_LEN_MASK;
        self.payload_info |= u32::from(flags & 0x0F) << PAYLOAD_FLAGS_SHIFT;
        self.seal();
        self
    }

    /// Set the image position and recompute the checksum
    pub fn with_offset(mut self, x: u16, y: u16) -> Self {
        self.h_offset_word = (self.h_offset_word & !COORD_MASK) | (x & COORD_MASK);
        self.v_offset_word = (self.v_offset_word & !COORD_MASK) | (y & COORD_MASK);
        self.seal();
        self
    }

    fn seal(&mut self) {
        let bytes = self.to_bytes();
        self.checksum = checksum(&bytes[..T5_HEADER_LEN - 1]);
    }

    /// 12-bit frame counter
    pub fn frame_counter(&self) -> u16 {
        self.frame_info & FRAME_COUNTER_MASK
    }

    /// Pixel bit depth
    pub fn pixel_format(&self) -> PixelFormat {
        PixelFormat::from_bits(((self.frame_info >> PIXEL_FORMAT_SHIFT) & PIXEL_FORMAT_MASK) as u8)
    }

    /// Whether the payload is compressed
    pub fn compressed(&self) -> bool {
        self.frame_info & COMPRESSION_BIT != 0
    }

    /// Horizontal pixel offset
    pub fn h_offset(&self) -> u16 {
        self.h_offset_word & COORD_MASK
    }

    /// Vertical pixel offset
    pub fn v_offset(&self) -> u16 {
        self.v_offset_word & COORD_MASK
    }

    /// Image width in pixels
    pub fn width(&self) -> u16 {
        self.width_word & COORD_MASK
    }

    /// Image height in pixels
    pub fn height(&self) -> u16 {
        self.height_word & COORD_MASK
    }

    /// Declared payload length following the header
    pub fn payload_len(&self) -> u32 {
        self.payload_info & PAYLOAD_LEN_MASK
    }

    /// Flag nibble of the payload-info word
    pub fn payload_flags(&self) -> u8 {
        (self.payload_info >> PAYLOAD_FLAGS_SHIFT) as u8
    }

    /// Cursor command carried by the flag nibble, if any
    pub fn cursor_command(&self) -> Option<CursorCommand> {
        match self.payload_flags() {
            PAYLOAD_FLAGS_CURSOR_ENABLE => Some(CursorCommand::Enable),
            PAYLOAD_FLAGS_CURSOR_DISABLE => Some(CursorCommand::Disable),
            _ => None,
        }
    }

    /// Whether bit0 of the other-flags byte is set as the device expects
    pub fn other_flags_valid(&self) -> bool {
        self.other_flags & 0x01 != 0
    }

    /// Serialize the header, including the stored checksum byte
    pub fn to_bytes(&self) -> [u8; T5_HEADER_LEN] {
        let mut bytes = [0u8; T5_HEADER_LEN];
        bytes[0] = self.magic;
        bytes[1] = self.header_len;
        bytes[2..4].copy_from_slice(&self.frame_info.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.h_offset_word.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.v_offset_word.to_le_bytes());
        bytes[8..10].copy_from_slice(&self.width_word.to_le_bytes());
        bytes[10..12].copy_from_slice(&self.height_word.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.payload_info.to_le_bytes());
        bytes[16] = self.other_flags;
        bytes[17..19].copy_from_slice(&self.unknown);
        bytes[19] = self.checksum;
        bytes
    }
}

/// Parse a Trigger 5 bulk header
///
/// Returns `None` when the buffer is too short or does not start with the
/// `0xFB 0x14` sentinel pair. The boolean reports whether the checksum byte
/// matches; a mismatch is advisory only.
pub fn parse_t5_header(data: &[u8]) -> Option<(HeaderRecord, bool)> {
    if data.len() < T5_HEADER_LEN {
        return None;
    }
    if data[0] != T5_MAGIC || data[1] as usize != T5_HEADER_LEN {
        return None;
    }

    let record = HeaderRecord {
        magic: data[0],
        header_len: data[1],
        frame_info: le_u16(data, 2),
        h_offset_word: le_u16(data, 4),
        v_offset_word: le_u16(data, 6),
        width_word: le_u16(data, 8),
        height_word: le_u16(data, 10),
        payload_info: le_u32(data, 12),
        other_flags: data[16],
        unknown: [data[17], data[18]],
        checksum: data[19],
    };
    let checksum_valid = checksum(&data[..T5_HEADER_LEN - 1]) == record.checksum;

    Some((record, checksum_valid))
}

/// Logical session carried by a Trigger 6 selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionKind {
    /// Session 0
    Video,
    /// Session 3
    Audio,
    /// Session 5
    FirmwareUpdate,
    /// Any other session number
    Other(u32),
}

impl From<u32> for SessionKind {
    fn from(v: u32) -> Self {
        match v {
            0 => Self::Video,
            3 => Self::Audio,
            5 => Self::FirmwareUpdate,
            other => Self::Other(other),
        }
    }
}

/// Trigger 6 bulk selector record
///
/// The destination address is not understood well enough to interpret and
/// is carried through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorRecord {
    /// Session number
    pub session: u32,
    /// Total length of the logical payload
    pub total_len: u32,
    /// Destination address (opaque)
    pub dest_addr: u32,
    /// Bytes following this selector
    pub fragment_len: u32,
    /// Offset of this fragment within the logical payload
    pub fragment_offset: u32,
    /// Video output index
    pub output_index: u32,
    /// Reserved words
    pub reserved: [u32; 2],
}

impl SelectorRecord {
    /// Selector for an unfragmented payload
    pub fn whole(session: u32, total_len: u32) -> Self {
        Self {
            session,
            total_len,
            dest_addr: 0,
            fragment_len: total_len,
            fragment_offset: 0,
            output_index: 0,
            reserved: [0, 0],
        }
    }

    /// Selector for one fragment of a larger payload
    pub fn fragment(session: u32, total_len: u32, fragment_offset: u32, fragment_len: u32) -> Self {
        Self {
            fragment_len,
            fragment_offset,
            ..Self::whole(session, total_len)
        }
    }

    /// Session kind
    pub fn session_kind(&self) -> SessionKind {
        SessionKind::from(self.session)
    }

    /// Serialize to the 32-byte wire form
    pub fn to_bytes(&self) -> [u8; T6_SELECTOR_LEN] {
        let words = [
            self.session,
            self.total_len,
            self.dest_addr,
            self.fragment_len,
            self.fragment_offset,
            self.output_index,
            self.reserved[0],
            self.reserved[1],
        ];
        let mut bytes = [0u8; T6_SELECTOR_LEN];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }
}

/// Parse a Trigger 6 selector record
///
/// Returns `None` when the buffer is shorter than [`T6_SELECTOR_LEN`].
pub fn parse_t6_selector(data: &[u8]) -> Option<SelectorRecord> {
    if data.len() < T6_SELECTOR_LEN {
        return None;
    }

    Some(SelectorRecord {
        session: le_u32(data, 0),
        total_len: le_u32(data, 4),
        dest_addr: le_u32(data, 8),
        fragment_len: le_u32(data, 12),
        fragment_offset: le_u32(data, 16),
        output_index: le_u32(data, 20),
        reserved: [le_u32(data, 24), le_u32(data, 28)],
    })
}

/// Record governing a reassembly lineage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GoverningRecord {
    /// Trigger 5 bulk header
    Trigger5(HeaderRecord),
    /// Trigger 6 selector
    Trigger6(SelectorRecord),
}

impl GoverningRecord {
    /// Declared total payload length
    pub fn total_len(&self) -> u64 {
        match self {
            Self::Trigger5(h) => u64::from(h.payload_len()),
            Self::Trigger6(s) => u64::from(s.total_len),
        }
    }
}

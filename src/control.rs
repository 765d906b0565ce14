//! Vendor control-transfer decoding
//!
//! Mode setting, EDID reads and adapter queries travel over the default
//! control pipe. OUT requests carry their payload in the setup stage's data;
//! IN requests return it in the completion. The setup fields of the transfer
//! are supplied with both stages, so `packet.data` holds only the data stage.

use serde::{Deserialize, Serialize};

use crate::config::HardwarePlatform;
use crate::packet::{Direction, ProtocolVariant, SetupFields, TransferType, UsbPacket};
use crate::timing::{
    decode_t5_mode_list, decode_t6_mode_list, decode_timing, TimingError, TimingLayout,
    VideoModeTiming,
};

const EDID_BLOCK_LEN: usize = 128;
const FIRMWARE_INFO_LEN: usize = 14;
const FIRMWARE_DATE_OFFSET: usize = 11;
const DEVICE_NAME_LEN: usize = 64;

/// Trigger 5 vendor requests
mod t5 {
    pub const FIRMWARE_INFO: u8 = 0xA1;
    pub const VIDEO_MODES: u8 = 0xA4;
    pub const REGISTER_READ: u8 = 0xA5;
    pub const EDID: u8 = 0xA8;
    pub const SET_VIDEO_MODE: u8 = 0xC3;
    pub const REGISTER_WRITE: u8 = 0xC4;
    pub const CURSOR_POSITION: u8 = 0xC8;
}

/// Trigger 6 vendor requests
mod t6 {
    pub const SET_VIDEO_MODE: u8 = 0x12;
    pub const EDID: u8 = 0x80;
    pub const VIDEO_MODES: u8 = 0x89;
    pub const ADAPTER_INFO: u8 = 0xB0;
    pub const SESSION_INFO: u8 = 0xB1;
    pub const CONFIG_INFO: u8 = 0xB3;
}

const CONFIG_TAG_UHAL: u32 = 0x4C41_4855;
const CONFIG_TAG_DISP: u32 = 0x5053_4944;
const CONFIG_TAG_AUDIO: u32 = 0x5F44_5541;
const CONFIG_TAG_GPIO: u32 = 0x4F49_5047;

/// Firmware version and build date reported by a Trigger 5 adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareInfo {
    /// Major, minor, patch
    pub version: [u8; 3],
    /// Build year
    pub build_year: u16,
    /// Build month
    pub build_month: u8,
    /// Build day
    pub build_day: u8,
}

impl FirmwareInfo {
    /// `major.minor.patch`
    pub fn version_string(&self) -> String {
        format!("{}.{}.{}", self.version[0], self.version[1], self.version[2])
    }
}

/// Virtual device identity announced by a Trigger 6 adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDevice {
    /// Vendor ID
    pub vendor_id: u16,
    /// Product ID
    pub product_id: u16,
    /// Device name
    pub name: String,
}

/// Trigger 6 adapter information field, selected by wIndex
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterInfo {
    /// Field 0
    HardwarePlatform(u32),
    /// Field 1
    BootCode(u32),
    /// Field 2
    ImageCode(u32),
    /// Field 3
    ProjectCode(String),
    /// Field 4
    VendorCommandVersion(u32),
    /// Field 5
    Serial(Vec<u8>),
    /// Undocumented field
    Other {
        /// Field index
        index: u16,
        /// Raw bytes
        data: Vec<u8>,
    },
}

/// Trigger 6 configuration blob type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigBlobKind {
    /// "UHAL"
    Uhal,
    /// "DISP"
    Display,
    /// "AUD_"
    Audio,
    /// "GPIO"
    Gpio,
    /// Unrecognised tag
    Other(u32),
}

impl From<u32> for ConfigBlobKind {
    fn from(tag: u32) -> Self {
        match tag {
            CONFIG_TAG_UHAL => Self::Uhal,
            CONFIG_TAG_DISP => Self::Display,
            CONFIG_TAG_AUDIO => Self::Audio,
            CONFIG_TAG_GPIO => Self::Gpio,
            other => Self::Other(other),
        }
    }
}

/// Trigger 6 configuration blob header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigBlob {
    /// Blob type
    pub kind: ConfigBlobKind,
    /// Declared blob size
    pub size: u32,
    /// Virtual device carried by display blobs
    pub display: Option<VirtualDevice>,
}

/// Decoded content of a vendor control transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlContent {
    /// Mode set
    VideoMode {
        /// Mode index (wValue), Trigger 5 only
        index: Option<u16>,
        /// Requested timing
        timing: VideoModeTiming,
    },
    /// Mode list reply
    VideoModes {
        /// Output index (wValue), Trigger 6 only
        output_index: Option<u16>,
        /// Byte offset into the list (wIndex), Trigger 6 only
        byte_offset: Option<u16>,
        /// Decoded entries
        modes: Vec<VideoModeTiming>,
    },
    /// Register write
    RegisterWrite {
        /// Register address (wIndex)
        address: u16,
        /// Written bytes
        value: Vec<u8>,
    },
    /// Register read reply
    RegisterRead {
        /// Register address (wIndex)
        address: u16,
        /// Returned bytes
        value: Vec<u8>,
    },
    /// Hardware cursor move
    CursorPosition {
        /// X (wValue)
        x: u16,
        /// Y (wIndex)
        y: u16,
    },
    /// Firmware version reply
    Firmware(FirmwareInfo),
    /// EDID block reply
    Edid {
        /// Byte offset of the block within the EDID
        offset: u32,
        /// Block bytes
        data: Vec<u8>,
    },
    /// Adapter information reply
    AdapterInfo(AdapterInfo),
    /// Session information reply
    SessionInfo {
        /// Session number (wIndex)
        session: u16,
        /// Virtual device
        device: VirtualDevice,
    },
    /// Configuration blob reply
    ConfigBlob(ConfigBlob),
    /// Request without a known layout
    Unknown {
        /// bRequest
        request: u8,
        /// Data stage
        data: Vec<u8>,
    },
    /// Data stage shorter than the request's layout
    TooShort {
        /// bRequest
        request: u8,
        /// Bytes the layout needs
        needed: usize,
        /// Bytes captured
        actual: usize,
    },
}

impl ControlContent {
    /// Short name of the content kind, for logs and summaries
    pub fn kind(&self) -> &'static str {
        match self {
            Self::VideoMode { .. } => "video mode",
            Self::VideoModes { .. } => "video mode list",
            Self::RegisterWrite { .. } => "register write",
            Self::RegisterRead { .. } => "register read",
            Self::CursorPosition { .. } => "cursor position",
            Self::Firmware(_) => "firmware info",
            Self::Edid { .. } => "EDID block",
            Self::AdapterInfo(_) => "adapter info",
            Self::SessionInfo { .. } => "session info",
            Self::ConfigBlob(_) => "config blob",
            Self::Unknown { .. } => "unknown request",
            Self::TooShort { .. } => "short data stage",
        }
    }
}

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

fn utf16le_string(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

fn ascii_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn too_short(request: u8, needed: usize, actual: usize) -> ControlContent {
    log::debug!(
        "Control request 0x{:02x}: need {} bytes, got {}",
        request,
        needed,
        actual
    );
    ControlContent::TooShort {
        request,
        needed,
        actual,
    }
}

fn from_timing_error(request: u8, err: TimingError) -> ControlContent {
    match err {
        TimingError::TooShort { needed, actual } => too_short(request, needed, actual),
    }
}

/// Decode a control transfer stage
///
/// Returns `None` for stages that carry nothing of interest: OUT
/// completions, IN setup stages, non-vendor Trigger 5 requests, and packets
/// without setup fields.
pub fn decode_control(
    variant: ProtocolVariant,
    packet: &UsbPacket,
    platform: HardwarePlatform,
) -> Option<ControlContent> {
    if packet.transfer_type != TransferType::Control {
        return None;
    }
    let setup = packet.setup?;

    let content = match (packet.direction, packet.is_setup) {
        (Direction::Out, true) => decode_out_setup(variant, &setup, &packet.data, platform)?,
        (Direction::In, false) => decode_in_completion(variant, &setup, &packet.data, platform)?,
        _ => return None,
    };
    log::debug!(
        "{}: {} control 0x{:02x} decoded as {}",
        packet.conversation,
        variant,
        setup.request,
        content.kind()
    );
    Some(content)
}

fn decode_out_setup(
    variant: ProtocolVariant,
    setup: &SetupFields,
    data: &[u8],
    platform: HardwarePlatform,
) -> Option<ControlContent> {
    let request = setup.request;
    let content = match variant {
        ProtocolVariant::Trigger5 => {
            if !setup.is_vendor() {
                return None;
            }
            match request {
                t5::SET_VIDEO_MODE => {
                    match decode_timing(data, TimingLayout::Trigger5Custom, platform) {
                        Ok(timing) => ControlContent::VideoMode {
                            index: Some(setup.value),
                            timing,
                        },
                        Err(e) => from_timing_error(request, e),
                    }
                }
                t5::REGISTER_WRITE => ControlContent::RegisterWrite {
                    address: setup.index,
                    value: data.to_vec(),
                },
                t5::CURSOR_POSITION => ControlContent::CursorPosition {
                    x: setup.value,
                    y: setup.index,
                },
                _ => ControlContent::Unknown {
                    request,
                    data: data.to_vec(),
                },
            }
        }
        ProtocolVariant::Trigger6 => match request {
            t6::SET_VIDEO_MODE => match decode_timing(data, TimingLayout::Trigger6, platform) {
                Ok(timing) => ControlContent::VideoMode {
                    index: None,
                    timing,
                },
                Err(e) => from_timing_error(request, e),
            },
            _ => ControlContent::Unknown {
                request,
                data: data.to_vec(),
            },
        },
    };
    Some(content)
}

fn decode_in_completion(
    variant: ProtocolVariant,
    setup: &SetupFields,
    data: &[u8],
    platform: HardwarePlatform,
) -> Option<ControlContent> {
    let request = setup.request;
    let content = match variant {
        ProtocolVariant::Trigger5 => {
            if !setup.is_vendor() {
                return None;
            }
            match request {
                t5::FIRMWARE_INFO => decode_firmware_info(data),
                t5::VIDEO_MODES => match decode_t5_mode_list(data) {
                    Ok(modes) => ControlContent::VideoModes {
                        output_index: None,
                        byte_offset: None,
                        modes,
                    },
                    Err(e) => from_timing_error(request, e),
                },
                t5::REGISTER_READ => ControlContent::RegisterRead {
                    address: setup.index,
                    value: data.to_vec(),
                },
                t5::EDID => decode_edid(request, u32::from(setup.value) * EDID_BLOCK_LEN as u32, data),
                _ => ControlContent::Unknown {
                    request,
                    data: data.to_vec(),
                },
            }
        }
        ProtocolVariant::Trigger6 => match request {
            t6::EDID => decode_edid(request, u32::from(setup.value), data),
            t6::VIDEO_MODES => ControlContent::VideoModes {
                output_index: Some(setup.value),
                byte_offset: Some(setup.index),
                modes: decode_t6_mode_list(data, platform),
            },
            t6::ADAPTER_INFO => decode_adapter_info(setup.index, data),
            t6::SESSION_INFO => match decode_virtual_device(data, 0) {
                Some(device) => ControlContent::SessionInfo {
                    session: setup.index,
                    device,
                },
                None => too_short(request, 4 + DEVICE_NAME_LEN, data.len()),
            },
            t6::CONFIG_INFO => decode_config_blob(data),
            _ => ControlContent::Unknown {
                request,
                data: data.to_vec(),
            },
        },
    };
    Some(content)
}

fn decode_firmware_info(data: &[u8]) -> ControlContent {
    if data.len() < FIRMWARE_INFO_LEN {
        return too_short(t5::FIRMWARE_INFO, FIRMWARE_INFO_LEN, data.len());
    }
    let date = &data[FIRMWARE_DATE_OFFSET..FIRMWARE_INFO_LEN];
    ControlContent::Firmware(FirmwareInfo {
        version: [data[0], data[1], data[2]],
        build_year: 2000 + u16::from(date[0]),
        build_month: date[1],
        build_day: date[2],
    })
}

fn decode_edid(request: u8, offset: u32, data: &[u8]) -> ControlContent {
    if data.len() < EDID_BLOCK_LEN {
        return too_short(request, EDID_BLOCK_LEN, data.len());
    }
    ControlContent::Edid {
        offset,
        data: data[..EDID_BLOCK_LEN].to_vec(),
    }
}

fn decode_virtual_device(data: &[u8], offset: usize) -> Option<VirtualDevice> {
    let name = data.get(offset + 4..offset + 4 + DEVICE_NAME_LEN)?;
    Some(VirtualDevice {
        vendor_id: le_u16(data, offset),
        product_id: le_u16(data, offset + 2),
        name: utf16le_string(name),
    })
}

fn decode_adapter_info(index: u16, data: &[u8]) -> ControlContent {
    let word = || (data.len() >= 4).then(|| le_u32(data, 0));
    let info = match index {
        0 => word().map(AdapterInfo::HardwarePlatform),
        1 => word().map(AdapterInfo::BootCode),
        2 => word().map(AdapterInfo::ImageCode),
        3 => Some(AdapterInfo::ProjectCode(ascii_string(data))),
        4 => word().map(AdapterInfo::VendorCommandVersion),
        5 => Some(AdapterInfo::Serial(data.to_vec())),
        _ => Some(AdapterInfo::Other {
            index,
            data: data.to_vec(),
        }),
    };
    match info {
        Some(info) => ControlContent::AdapterInfo(info),
        None => too_short(t6::ADAPTER_INFO, 4, data.len()),
    }
}

fn decode_config_blob(data: &[u8]) -> ControlContent {
    if data.len() < 8 {
        return too_short(t6::CONFIG_INFO, 8, data.len());
    }
    let kind = ConfigBlobKind::from(le_u32(data, 0));
    let size = le_u32(data, 4);
    let display = match kind {
        ConfigBlobKind::Display => match decode_virtual_device(data, 12) {
            Some(device) => Some(device),
            None => return too_short(t6::CONFIG_INFO, 16 + DEVICE_NAME_LEN, data.len()),
        },
        _ => None,
    };
    ControlContent::ConfigBlob(ConfigBlob {
        kind,
        size,
        display,
    })
}

//! Video mode / timing record decoding
//!
//! Three fixed layouts appear in control-transfer data stages:
//! - Trigger 5 mode summary (8 bytes), as listed by the mode query
//! - Trigger 5 custom timing (35 bytes, big-endian), as sent by mode set
//! - Trigger 6 mode record (32 bytes, little-endian), used by both query and set
//!
//! Besides the raw fields, decoding reconstructs the PLL output frequency and
//! the refresh rate it implies.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::HardwarePlatform;

/// Size of a Trigger 5 mode summary entry
pub const T5_SUMMARY_LEN: usize = 8;
/// Size of a Trigger 5 custom timing record
pub const T5_CUSTOM_LEN: usize = 35;
/// Size of a Trigger 6 mode record
pub const T6_MODE_LEN: usize = 32;

/// Offset of the first summary entry in a Trigger 5 mode list reply
const T5_MODE_LIST_OFFSET: usize = 4;

const T5_PLL_REFERENCE_HZ: u64 = 10_000_000;

/// Errors raised by the timing decoder.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimingError {
    /// Buffer is shorter than the fixed record size.
    #[error("timing record too short: need {needed} bytes, got {actual}")]
    TooShort {
        /// Bytes required by the layout.
        needed: usize,
        /// Bytes available.
        actual: usize,
    },
}

/// Result type alias for timing decoding.
pub type Result<T> = std::result::Result<T, TimingError>;

/// Which fixed layout to decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimingLayout {
    /// Trigger 5 mode summary
    Trigger5Summary,
    /// Trigger 5 custom timing
    Trigger5Custom,
    /// Trigger 6 mode record
    Trigger6,
}

impl TimingLayout {
    /// Record size in bytes
    pub const fn size(self) -> usize {
        match self {
            Self::Trigger5Summary => T5_SUMMARY_LEN,
            Self::Trigger5Custom => T5_CUSTOM_LEN,
            Self::Trigger6 => T6_MODE_LEN,
        }
    }
}

/// Sync pulse polarity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPolarity {
    /// Active high
    Positive,
    /// Active low
    Negative,
}

impl From<u8> for SyncPolarity {
    fn from(v: u8) -> Self {
        if v == 0 {
            Self::Positive
        } else {
            Self::Negative
        }
    }
}

/// Trigger 5 mode summary entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct T5ModeSummary {
    /// Refresh rate in Hz
    pub refresh_rate_hz: u8,
    /// Pixel clock in MHz
    pub pixel_clock_mhz: u8,
    /// Bits per pixel
    pub bits_per_pixel: u8,
    /// Mode number
    pub mode_number: u8,
    /// Height in lines
    pub height: u16,
    /// Width in pixels
    pub width: u16,
}

/// Trigger 5 PLL configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct T5PllConfig {
    /// Reference pre-divider
    pub pre_div: u8,
    /// First multiplier
    pub mul0: u8,
    /// Second multiplier
    pub mul1: u8,
    /// First post-divider
    pub div0: u8,
    /// Second post-divider
    pub div1: u8,
}

impl T5PllConfig {
    /// Output frequency: `10 MHz / pre_div * mul0 * mul1 / div0 / div1`
    ///
    /// `None` when any divider is zero.
    pub fn frequency_hz(&self) -> Option<u64> {
        let divisor = u64::from(self.pre_div) * u64::from(self.div0) * u64::from(self.div1);
        if divisor == 0 {
            return None;
        }
        Some(T5_PLL_REFERENCE_HZ * u64::from(self.mul0) * u64::from(self.mul1) / divisor)
    }
}

/// Trigger 5 custom timing record
///
/// Most counts are stored on the wire minus one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct T5ModeTiming {
    /// Active lines
    pub vertical_resolution: u16,
    /// Active pixels per line
    pub horizontal_resolution: u16,
    /// Total pixels per line, minus one
    pub line_total_minus_one: u16,
    /// Horizontal sync pulse width, minus one
    pub line_sync_pulse_minus_one: u16,
    /// Horizontal back porch, minus one
    pub line_back_porch_minus_one: u16,
    /// Unknown horizontal words
    pub line_unknown: [u16; 2],
    /// Active pixels per line, minus one
    pub horizontal_resolution_minus_one: u16,
    /// Total lines per frame, minus one
    pub frame_total_minus_one: u16,
    /// Vertical sync pulse width, minus one
    pub frame_sync_pulse_minus_one: u16,
    /// Vertical back porch, minus one
    pub frame_back_porch_minus_one: u16,
    /// Unknown vertical words
    pub frame_unknown: [u16; 2],
    /// Active lines, minus one
    pub vertical_resolution_minus_one: u16,
    /// PLL configuration
    pub pll: T5PllConfig,
    /// Horizontal sync polarity
    pub h_sync_polarity: SyncPolarity,
    /// Vertical sync polarity
    pub v_sync_polarity: SyncPolarity,
}

impl T5ModeTiming {
    /// Total pixels per line
    pub fn line_total_pixels(&self) -> u32 {
        u32::from(self.line_total_minus_one) + 1
    }

    /// Total lines per frame
    pub fn frame_total_lines(&self) -> u32 {
        u32::from(self.frame_total_minus_one) + 1
    }
}

/// Trigger 6 PLL configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct T6PllConfig {
    /// Fractional numerator
    pub fnum: u16,
    /// Fractional denominator
    pub fden: u16,
    /// Integer divider
    pub idiv: u8,
    /// Multiplier stage enable bits
    pub multiplier_enable: u8,
}

impl T6PllConfig {
    /// Output multiplier: each enabled stage doubles the frequency
    pub fn multiplier(&self) -> u64 {
        1u64 << self.multiplier_enable.count_ones()
    }

    /// Output frequency: `(fnum + fden * idiv) * mul * base_clock_mhz / 32`
    pub fn frequency_hz(&self, base_clock_mhz: u32) -> u64 {
        let steps = u64::from(self.fnum) + u64::from(self.fden) * u64::from(self.idiv);
        steps * self.multiplier() * u64::from(base_clock_mhz) * 1_000_000 / 32
    }
}

/// Trigger 6 mode record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct T6ModeTiming {
    /// Pixel clock reported by the record, in kHz
    pub pixel_clock_khz: u32,
    /// Refresh rate reported by the record, in Hz
    pub refresh_rate_hz: u16,
    /// Total pixels per line
    pub line_total_pixels: u16,
    /// Active pixels per line
    pub line_active_pixels: u16,
    /// Active pixels plus front porch
    pub line_active_plus_front_porch_pixels: u16,
    /// Horizontal sync width
    pub line_sync_width: u16,
    /// Total lines per frame
    pub frame_total_lines: u16,
    /// Active lines per frame
    pub frame_active_lines: u16,
    /// Active lines plus front porch
    pub frame_active_plus_front_porch_lines: u16,
    /// Vertical sync width
    pub frame_sync_width: u16,
    /// PLL configuration
    pub pll: T6PllConfig,
    /// Horizontal sync polarity
    pub h_sync_polarity: SyncPolarity,
    /// Vertical sync polarity
    pub v_sync_polarity: SyncPolarity,
    /// Reduced blanking timing
    pub reduced_blanking: bool,
    /// Flag byte, bit0 set for custom (non-standard) timing
    pub flags: u8,
}

impl T6ModeTiming {
    /// Whether the mode uses custom timing rather than a standard one
    pub fn is_custom(&self) -> bool {
        self.flags & 0x01 != 0
    }
}

/// Raw decoded record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimingRecord {
    /// Trigger 5 mode summary
    Trigger5Summary(T5ModeSummary),
    /// Trigger 5 custom timing
    Trigger5Custom(T5ModeTiming),
    /// Trigger 6 mode record
    Trigger6(T6ModeTiming),
}

/// Decoded video mode with derived clocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoModeTiming {
    /// Raw record fields
    pub record: TimingRecord,
    /// Frequency reconstructed from the PLL configuration, when the record has one
    pub pll_clock_hz: Option<u64>,
    /// Refresh rate derived from pixel clock and totals
    pub refresh_rate_hz: Option<f64>,
}

impl VideoModeTiming {
    fn new(record: TimingRecord, platform: HardwarePlatform) -> Self {
        let pll_clock_hz = match &record {
            TimingRecord::Trigger5Summary(_) => None,
            TimingRecord::Trigger5Custom(t) => t.pll.frequency_hz(),
            TimingRecord::Trigger6(t) => Some(t.pll.frequency_hz(platform.base_clock_mhz())),
        };
        let mut timing = Self {
            record,
            pll_clock_hz,
            refresh_rate_hz: None,
        };
        timing.refresh_rate_hz = timing.derive_refresh_rate();
        timing
    }

    fn derive_refresh_rate(&self) -> Option<f64> {
        let (clock_hz, line_total, frame_total) = match &self.record {
            TimingRecord::Trigger5Summary(s) => return Some(f64::from(s.refresh_rate_hz)),
            TimingRecord::Trigger5Custom(t) => (
                self.pll_clock_hz?,
                t.line_total_pixels(),
                t.frame_total_lines(),
            ),
            TimingRecord::Trigger6(t) => (
                u64::from(t.pixel_clock_khz) * 1000,
                u32::from(t.line_total_pixels),
                u32::from(t.frame_total_lines),
            ),
        };
        let pixels_per_frame = u64::from(line_total) * u64::from(frame_total);
        if pixels_per_frame == 0 {
            return None;
        }
        Some(clock_hz as f64 / pixels_per_frame as f64)
    }

    /// Active width in pixels
    pub fn width(&self) -> u32 {
        match &self.record {
            TimingRecord::Trigger5Summary(s) => u32::from(s.width),
            TimingRecord::Trigger5Custom(t) => u32::from(t.horizontal_resolution),
            TimingRecord::Trigger6(t) => u32::from(t.line_active_pixels),
        }
    }

    /// Active height in lines
    pub fn height(&self) -> u32 {
        match &self.record {
            TimingRecord::Trigger5Summary(s) => u32::from(s.height),
            TimingRecord::Trigger5Custom(t) => u32::from(t.vertical_resolution),
            TimingRecord::Trigger6(t) => u32::from(t.frame_active_lines),
        }
    }

    /// Pixel clock in Hz
    ///
    /// Trigger 5 custom timings only carry a PLL configuration, so the
    /// reconstructed frequency is used. The other layouts report the clock
    /// directly.
    pub fn pixel_clock_hz(&self) -> Option<u64> {
        match &self.record {
            TimingRecord::Trigger5Summary(s) => Some(u64::from(s.pixel_clock_mhz) * 1_000_000),
            TimingRecord::Trigger5Custom(_) => self.pll_clock_hz,
            TimingRecord::Trigger6(t) => Some(u64::from(t.pixel_clock_khz) * 1000),
        }
    }
}

#[inline]
fn be_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

#[inline]
fn le_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

/// Decode one fixed-layout timing record
///
/// `platform` supplies the Trigger 6 PLL reference clock and is ignored for
/// Trigger 5 layouts. Bytes beyond the record size are ignored.
///
/// # Errors
///
/// Returns `TimingError::TooShort` if `bytes` is shorter than the layout.
pub fn decode_timing(
    bytes: &[u8],
    layout: TimingLayout,
    platform: HardwarePlatform,
) -> Result<VideoModeTiming> {
    let needed = layout.size();
    if bytes.len() < needed {
        return Err(TimingError::TooShort {
            needed,
            actual: bytes.len(),
        });
    }

    let record = match layout {
        TimingLayout::Trigger5Summary => TimingRecord::Trigger5Summary(T5ModeSummary {
            refresh_rate_hz: bytes[0],
            pixel_clock_mhz: bytes[1],
            bits_per_pixel: bytes[2],
            mode_number: bytes[3],
            height: le_u16(bytes, 4),
            width: le_u16(bytes, 6),
        }),
        TimingLayout::Trigger5Custom => TimingRecord::Trigger5Custom(T5ModeTiming {
            vertical_resolution: be_u16(bytes, 0),
            horizontal_resolution: be_u16(bytes, 2),
            line_total_minus_one: be_u16(bytes, 4),
            line_sync_pulse_minus_one: be_u16(bytes, 6),
            line_back_porch_minus_one: be_u16(bytes, 8),
            line_unknown: [be_u16(bytes, 10), be_u16(bytes, 12)],
            horizontal_resolution_minus_one: be_u16(bytes, 14),
            frame_total_minus_one: be_u16(bytes, 16),
            frame_sync_pulse_minus_one: be_u16(bytes, 18),
            frame_back_porch_minus_one: be_u16(bytes, 20),
            frame_unknown: [be_u16(bytes, 22), be_u16(bytes, 24)],
            vertical_resolution_minus_one: be_u16(bytes, 26),
            pll: T5PllConfig {
                pre_div: bytes[28],
                mul0: bytes[29],
                mul1: bytes[30],
                div0: bytes[31],
                div1: bytes[32],
            },
            h_sync_polarity: SyncPolarity::from(bytes[33]),
            v_sync_polarity: SyncPolarity::from(bytes[34]),
        }),
        TimingLayout::Trigger6 => TimingRecord::Trigger6(T6ModeTiming {
            pixel_clock_khz: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            refresh_rate_hz: le_u16(bytes, 4),
            line_total_pixels: le_u16(bytes, 6),
            line_active_pixels: le_u16(bytes, 8),
            line_active_plus_front_porch_pixels: le_u16(bytes, 10),
            line_sync_width: le_u16(bytes, 12),
            frame_total_lines: le_u16(bytes, 14),
            frame_active_lines: le_u16(bytes, 16),
            frame_active_plus_front_porch_lines: le_u16(bytes, 18),
            frame_sync_width: le_u16(bytes, 20),
            pll: T6PllConfig {
                fnum: le_u16(bytes, 22),
                fden: le_u16(bytes, 24),
                idiv: bytes[26],
                multiplier_enable: bytes[27],
            },
            h_sync_polarity: SyncPolarity::from(bytes[28]),
            v_sync_polarity: SyncPolarity::from(bytes[29]),
            reduced_blanking: bytes[30] != 0,
            flags: bytes[31],
        }),
    };

    Ok(VideoModeTiming::new(record, platform))
}

/// Decode a Trigger 5 mode list reply
///
/// The reply starts with a big-endian entry count; entries begin at offset 4.
/// Entries cut off by the end of the buffer are dropped.
///
/// # Errors
///
/// Returns `TimingError::TooShort` if the count prefix is missing.
pub fn decode_t5_mode_list(bytes: &[u8]) -> Result<Vec<VideoModeTiming>> {
    if bytes.len() < T5_MODE_LIST_OFFSET {
        return Err(TimingError::TooShort {
            needed: T5_MODE_LIST_OFFSET,
            actual: bytes.len(),
        });
    }

    let declared = usize::from(be_u16(bytes, 0));
    let available = (bytes.len() - T5_MODE_LIST_OFFSET) / T5_SUMMARY_LEN;
    if declared > available {
        log::debug!(
            "T5 mode list declares {} entries, only {} captured",
            declared,
            available
        );
    }

    bytes[T5_MODE_LIST_OFFSET..]
        .chunks_exact(T5_SUMMARY_LEN)
        .take(declared)
        .map(|entry| decode_timing(entry, TimingLayout::Trigger5Summary, HardwarePlatform::default()))
        .collect()
}

/// Decode a Trigger 6 mode list reply (consecutive 32-byte records)
pub fn decode_t6_mode_list(bytes: &[u8], platform: HardwarePlatform) -> Vec<VideoModeTiming> {
    bytes
        .chunks_exact(T6_MODE_LEN)
        .filter_map(|record| decode_timing(record, TimingLayout::Trigger6, platform).ok())
        .collect()
}

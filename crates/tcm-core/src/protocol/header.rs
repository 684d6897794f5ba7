//! Wire structures: the message header and the info blocks returned by
//! identify / application / boot / ROM-boot queries.
//!
//! Info blocks are decoded from the leading bytes of a payload. Firmware
//! revisions may send shorter blocks, so missing trailing fields read as zero.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use thiserror::Error;

use super::constants::{MESSAGE_HEADER_SIZE, MESSAGE_MARKER};
use super::status::{FirmwareMode, StatusCode};

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("Invalid marker: expected 0x{expected:02X}, got 0x{actual:02X}")]
    InvalidMarker { expected: u8, actual: u8 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Copy `data` into a zeroed block of `N` bytes, truncating if longer.
fn zero_padded<const N: usize>(data: &[u8]) -> [u8; N] {
    let mut block = [0u8; N];
    let len = data.len().min(N);
    block[..len].copy_from_slice(&data[..len]);
    block
}

/// Message header (4 bytes): `[marker][code][length_lo][length_hi]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub marker: u8,
    pub code: StatusCode,
    pub length: u16,
}

impl MessageHeader {
    pub const SIZE: usize = MESSAGE_HEADER_SIZE;

    pub fn new(code: u8, length: u16) -> Self {
        Self {
            marker: MESSAGE_MARKER,
            code: StatusCode(code),
            length,
        }
    }

    /// Decode without validating the marker.
    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        if data.len() < Self::SIZE {
            return Err(HeaderError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        Ok(Self {
            marker: cursor.read_u8()?,
            code: StatusCode(cursor.read_u8()?),
            length: cursor.read_u16::<LittleEndian>()?,
        })
    }

    pub fn validate_marker(&self) -> Result<(), HeaderError> {
        if self.marker != MESSAGE_MARKER {
            return Err(HeaderError::InvalidMarker {
                expected: MESSAGE_MARKER,
                actual: self.marker,
            });
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let len = self.length.to_le_bytes();
        [self.marker, self.code.value(), len[0], len[1]]
    }

    /// Header + payload + trailing padding byte.
    pub fn total_length(&self) -> usize {
        Self::SIZE + self.length as usize + 1
    }
}

/// Identification block (payload of the identify report, 24 bytes).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifyInfo {
    pub version: u8,
    pub mode: FirmwareMode,
    pub part_number: [u8; 16],
    /// Packrat build number.
    pub build_id: u32,
    pub max_write_size: u16,
}

impl IdentifyInfo {
    pub const SIZE: usize = 24;

    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        let block: [u8; Self::SIZE] = zero_padded(data);
        let mut cursor = Cursor::new(&block[..]);
        let version = cursor.read_u8()?;
        let mode = FirmwareMode::from_code(cursor.read_u8()?);
        let mut part_number = [0u8; 16];
        std::io::Read::read_exact(&mut cursor, &mut part_number)?;
        Ok(Self {
            version,
            mode,
            part_number,
            build_id: cursor.read_u32::<LittleEndian>()?,
            max_write_size: cursor.read_u16::<LittleEndian>()?,
        })
    }

    /// Decode `data` laid over this block. Bytes past the end of a short
    /// identify payload keep their current value.
    pub fn overlay(&self, data: &[u8]) -> Result<Self, HeaderError> {
        let mut block = self.to_bytes();
        let n = data.len().min(Self::SIZE);
        block[..n].copy_from_slice(&data[..n]);
        Self::from_bytes(&block)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.push(self.version);
        buf.push(self.mode.code());
        buf.extend_from_slice(&self.part_number);
        buf.extend_from_slice(&self.build_id.to_le_bytes());
        buf.extend_from_slice(&self.max_write_size.to_le_bytes());
        buf
    }

    /// Part number as printable text, trailing NULs stripped.
    pub fn part_number_str(&self) -> String {
        let end = self
            .part_number
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.part_number.len());
        String::from_utf8_lossy(&self.part_number[..end]).into_owned()
    }
}

/// Application info block (GET_APPLICATION_INFO, 48 bytes).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppInfo {
    pub version: u16,
    pub status: u16,
    pub static_config_size: u16,
    pub dynamic_config_size: u16,
    pub app_config_start_write_block: u16,
    pub app_config_size: u16,
    pub max_touch_report_config_size: u16,
    pub max_touch_report_payload_size: u16,
    pub customer_config_id: [u8; 16],
    pub max_x: u16,
    pub max_y: u16,
    pub max_objects: u16,
    pub num_of_buttons: u16,
    pub num_of_image_rows: u16,
    pub num_of_image_cols: u16,
    pub has_hybrid_data: u16,
    pub num_of_force_elecs: u16,
}

impl AppInfo {
    pub const SIZE: usize = 48;

    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        let block: [u8; Self::SIZE] = zero_padded(data);
        let mut c = Cursor::new(&block[..]);
        let version = c.read_u16::<LittleEndian>()?;
        let status = c.read_u16::<LittleEndian>()?;
        let static_config_size = c.read_u16::<LittleEndian>()?;
        let dynamic_config_size = c.read_u16::<LittleEndian>()?;
        let app_config_start_write_block = c.read_u16::<LittleEndian>()?;
        let app_config_size = c.read_u16::<LittleEndian>()?;
        let max_touch_report_config_size = c.read_u16::<LittleEndian>()?;
        let max_touch_report_payload_size = c.read_u16::<LittleEndian>()?;
        let mut customer_config_id = [0u8; 16];
        std::io::Read::read_exact(&mut c, &mut customer_config_id)?;
        Ok(Self {
            version,
            status,
            static_config_size,
            dynamic_config_size,
            app_config_start_write_block,
            app_config_size,
            max_touch_report_config_size,
            max_touch_report_payload_size,
            customer_config_id,
            max_x: c.read_u16::<LittleEndian>()?,
            max_y: c.read_u16::<LittleEndian>()?,
            max_objects: c.read_u16::<LittleEndian>()?,
            num_of_buttons: c.read_u16::<LittleEndian>()?,
            num_of_image_rows: c.read_u16::<LittleEndian>()?,
            num_of_image_cols: c.read_u16::<LittleEndian>()?,
            has_hybrid_data: c.read_u16::<LittleEndian>()?,
            num_of_force_elecs: c.read_u16::<LittleEndian>()?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        for v in [
            self.version,
            self.status,
            self.static_config_size,
            self.dynamic_config_size,
            self.app_config_start_write_block,
            self.app_config_size,
            self.max_touch_report_config_size,
            self.max_touch_report_payload_size,
        ] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf.extend_from_slice(&self.customer_config_id);
        for v in [
            self.max_x,
            self.max_y,
            self.max_objects,
            self.num_of_buttons,
            self.num_of_image_rows,
            self.num_of_image_cols,
            self.has_hybrid_data,
            self.num_of_force_elecs,
        ] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf
    }
}

/// Bootloader info block (GET_BOOT_INFO).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootInfo {
    pub version: u8,
    pub status: u8,
    pub asic_id: u16,
    pub write_block_size_words: u8,
    pub erase_page_size_words: u16,
    pub max_write_payload_size: u16,
    pub last_reset_reason: u8,
    pub pc_at_time_of_last_reset: u16,
    pub boot_config_start_block: u16,
    pub boot_config_size_blocks: u16,
}

impl BootInfo {
    pub const SIZE: usize = 17;

    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        let block: [u8; Self::SIZE] = zero_padded(data);
        let mut c = Cursor::new(&block[..]);
        Ok(Self {
            version: c.read_u8()?,
            status: c.read_u8()?,
            asic_id: c.read_u16::<LittleEndian>()?,
            write_block_size_words: c.read_u8()?,
            erase_page_size_words: c.read_u16::<LittleEndian>()?,
            max_write_payload_size: c.read_u16::<LittleEndian>()?,
            last_reset_reason: c.read_u8()?,
            pc_at_time_of_last_reset: c.read_u16::<LittleEndian>()?,
            boot_config_start_block: c.read_u16::<LittleEndian>()?,
            boot_config_size_blocks: c.read_u16::<LittleEndian>()?,
        })
    }
}

/// ROM bootloader info block (GET_ROMBOOT_INFO).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RomBootInfo {
    pub version: u8,
    pub status: u8,
    pub asic_id: u16,
    pub write_block_size_words: u8,
    pub max_write_payload_size: u16,
    pub last_reset_reason: u8,
    pub pc_at_time_of_last_reset: u16,
}

impl RomBootInfo {
    pub const SIZE: usize = 11;

    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        let block: [u8; Self::SIZE] = zero_padded(data);
        let mut c = Cursor::new(&block[..]);
        Ok(Self {
            version: c.read_u8()?,
            status: c.read_u8()?,
            asic_id: c.read_u16::<LittleEndian>()?,
            write_block_size_words: c.read_u8()?,
            max_write_payload_size: c.read_u16::<LittleEndian>()?,
            last_reset_reason: c.read_u8()?,
            pc_at_time_of_last_reset: c.read_u16::<LittleEndian>()?,
        })
    }
}

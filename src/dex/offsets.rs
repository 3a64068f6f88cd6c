//! Bit-exact byte offsets and constants of the dex container header.
//!
//! The checksum covers everything after the signature field; the signature
//! covers everything after itself. Both are relied on byte-for-byte by the
//! format's own self-consistency checks.

pub const MAGIC: [u8; 4] = *b"dex\n";
pub const ENDIAN_CONSTANT: u32 = 0x1234_5678;
pub const NO_INDEX: u32 = 0xffff_ffff;

pub const VERSION_OFFSET: usize = 0x04;
pub const CHECKSUM_OFFSET: usize = 0x08;
pub const SIGNATURE_OFFSET: usize = 0x0c;
pub const SIGNATURE_SIZE: usize = 20;
pub const FILE_SIZE_OFFSET: usize = 0x20;
pub const HEADER_SIZE_OFFSET: usize = 0x24;
pub const ENDIAN_TAG_OFFSET: usize = 0x28;
pub const DATA_SIZE_OFFSET: usize = 0x68;
pub const DATA_OFF_OFFSET: usize = 0x6c;

/// Header length for standard (non-container) versions.
pub const BASE_HEADER_SIZE: u32 = 0x70;

/// Container (version 041) additions.
pub const CONTAINER_SIZE_OFFSET: usize = 0x70;
pub const HEADER_OFF_OFFSET: usize = 0x74;
pub const CONTAINER_HEADER_SIZE: u32 = 0x78;

/// The checksum's rolling sum starts right after the checksum field.
pub const CHECKSUM_DATA_START: usize = SIGNATURE_OFFSET;
/// The signature digest starts right after the signature field.
pub const SIGNATURE_DATA_START: usize = FILE_SIZE_OFFSET;

const fn version_word(a: u8, b: u8, c: u8) -> u32 {
    u32::from_le_bytes([a, b, c, 0])
}

/// Generic dex versions accepted for repair and reading.
pub fn is_standard_version(version: u32) -> bool {
    version == version_word(b'0', b'3', b'5')
        || version == version_word(b'0', b'3', b'7')
        || version == version_word(b'0', b'3', b'8')
        || version == version_word(b'0', b'3', b'9')
        || version == version_word(b'0', b'4', b'0')
}

/// Multi-header container version.
pub fn is_container_version(version: u32) -> bool {
    version == version_word(b'0', b'4', b'1')
}

//! Classic relocation entries, consumed when rebasing images that predate
//! compressed LINKEDIT.

use scroll::{Endian, Pread, Pwrite, SizeWith};

use crate::error;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct RelocationInfo {
    /// Offset in the section to what is being relocated.
    pub r_address: i32,
    /// symbolnum:24, pcrel:1, length:2, extern:1, type:4
    pub r_info: u32,
}

pub const SIZEOF_RELOCATION_INFO: usize = 8;

/// Generic relocation kind: a pointer to slide.
pub const GENERIC_RELOC_VANILLA: u8 = 0;

/// Scattered relocations have the high bit of `r_address` set; the linker
/// does not rebase through them.
pub const R_SCATTERED: u32 = 0x8000_0000;

impl RelocationInfo {
    #[inline]
    pub fn r_symbolnum(&self) -> u32 {
        self.r_info & 0x00ff_ffff
    }

    #[inline]
    pub fn r_pcrel(&self) -> bool {
        self.r_info & 0x0100_0000 != 0
    }

    /// Log2 of the relocated quantity's byte size.
    #[inline]
    pub fn r_length(&self) -> u8 {
        ((self.r_info >> 25) & 0x3) as u8
    }

    #[inline]
    pub fn r_extern(&self) -> bool {
        self.r_info & 0x0800_0000 != 0
    }

    #[inline]
    pub fn r_type(&self) -> u8 {
        ((self.r_info >> 28) & 0xf) as u8
    }

    #[inline]
    pub fn is_scattered(&self) -> bool {
        (self.r_address as u32) & R_SCATTERED != 0
    }
}

/// Parse `count` relocation entries at `offset`.
pub fn parse(
    bytes: &[u8],
    offset: usize,
    count: usize,
    le: Endian,
) -> error::Result<Vec<RelocationInfo>> {
    let mut relocs = Vec::with_capacity(count);
    let mut cursor = offset;
    for _ in 0..count {
        relocs.push(bytes.gread_with::<RelocationInfo>(&mut cursor, le)?);
    }
    Ok(relocs)
}

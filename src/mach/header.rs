//! The Mach-O header: magic sniffing and the flag bits the linker honors.

use scroll::{BE, LE, Pread, Pwrite, SizeWith};

use crate::container::{Container, Ctx};
use crate::error;

/// 32-bit header magic.
pub const MH_MAGIC: u32 = 0xfeed_face;
pub const MH_CIGAM: u32 = 0xcefa_edfe;
/// 64-bit header magic.
pub const MH_MAGIC_64: u32 = 0xfeed_facf;
pub const MH_CIGAM_64: u32 = 0xcffa_edfe;

// Filetypes.
/// Demand paged executable file.
pub const MH_EXECUTE: u32 = 0x2;
/// Dynamically bound shared library.
pub const MH_DYLIB: u32 = 0x6;
/// The dynamic linker itself.
pub const MH_DYLINKER: u32 = 0x7;
/// Dynamically bound bundle file.
pub const MH_BUNDLE: u32 = 0x8;

// Flag bits the linker reads.
/// The object file has no undefined references.
pub const MH_NOUNDEFS: u32 = 0x1;
/// Input for the dynamic linker.
pub const MH_DYLDLINK: u32 = 0x4;
/// Undefined references are bound by the dynamic linker when loaded.
pub const MH_BINDATLOAD: u32 = 0x8;
/// The file has its dynamic undefined references prebound.
pub const MH_PREBOUND: u32 = 0x10;
/// The image uses two-level namespace bindings.
pub const MH_TWOLEVEL: u32 = 0x80;
/// The executable forces all images to use flat namespace bindings.
pub const MH_FORCE_FLAT: u32 = 0x100;
/// The final linked image contains external weak symbols.
pub const MH_WEAK_DEFINES: u32 = 0x8000;
/// The final linked image uses weak symbols.
pub const MH_BINDS_TO_WEAK: u32 = 0x10000;
/// The binary declares it is safe for use in setuid processes.
pub const MH_SETUID_SAFE: u32 = 0x80000;
/// The OS loads the main executable at a random address.
pub const MH_PIE: u32 = 0x200000;

pub fn filetype_to_str(filetype: u32) -> &'static str {
    match filetype {
        MH_EXECUTE => "EXECUTE",
        MH_DYLIB => "DYLIB",
        MH_DYLINKER => "DYLINKER",
        MH_BUNDLE => "BUNDLE",
        _ => "UNKNOWN FILETYPE",
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct Header32 {
    pub magic: u32,
    pub cputype: u32,
    pub cpusubtype: u32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
}

pub const SIZEOF_HEADER_32: usize = 28;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct Header64 {
    pub magic: u32,
    pub cputype: u32,
    pub cpusubtype: u32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
    pub reserved: u32,
}

pub const SIZEOF_HEADER_64: usize = 32;

/// A width-unified Mach-O header.
#[derive(Debug, Clone, Copy, Default)]
pub struct Header {
    pub magic: u32,
    pub cputype: u32,
    pub cpusubtype: u32,
    pub filetype: u32,
    pub ncmds: usize,
    pub sizeofcmds: u32,
    pub flags: u32,
}

impl From<Header32> for Header {
    fn from(h: Header32) -> Self {
        Header {
            magic: h.magic,
            cputype: h.cputype,
            cpusubtype: h.cpusubtype,
            filetype: h.filetype,
            ncmds: h.ncmds as usize,
            sizeofcmds: h.sizeofcmds,
            flags: h.flags,
        }
    }
}

impl From<Header64> for Header {
    fn from(h: Header64) -> Self {
        Header {
            magic: h.magic,
            cputype: h.cputype,
            cpusubtype: h.cpusubtype,
            filetype: h.filetype,
            ncmds: h.ncmds as usize,
            sizeofcmds: h.sizeofcmds,
            flags: h.flags,
        }
    }
}

impl Header {
    /// Size of the header on disk for the given context.
    pub fn size(ctx: Ctx) -> usize {
        match ctx.container {
            Container::Little => SIZEOF_HEADER_32,
            Container::Big => SIZEOF_HEADER_64,
        }
    }

    /// Derive the parse context from the magic; fails on non-Mach-O
    /// magic values.
    pub fn ctx_for_magic(magic: u32) -> Option<Ctx> {
        match magic {
            MH_MAGIC => Some(Ctx::new(Container::Little, LE)),
            MH_CIGAM => Some(Ctx::new(Container::Little, BE)),
            MH_MAGIC_64 => Some(Ctx::new(Container::Big, LE)),
            MH_CIGAM_64 => Some(Ctx::new(Container::Big, BE)),
            _ => None,
        }
    }

    /// Parse a header at `offset`, deciding the context from the magic.
    pub fn parse(bytes: &[u8], offset: usize) -> error::Result<(Header, Ctx)> {
        // The magic is endian-revealing: read it native-little first.
        let magic: u32 = bytes.pread_with(offset, LE)?;
        let ctx = Header::ctx_for_magic(magic).ok_or_else(|| error::Error::MalformedImage {
            path: Default::default(),
            reason: format!("bad magic {:#x}", magic),
        })?;
        let header = match ctx.container {
            Container::Little => bytes.pread_with::<Header32>(offset, ctx.le)?.into(),
            Container::Big => bytes.pread_with::<Header64>(offset, ctx.le)?.into(),
        };
        Ok((header, ctx))
    }

    #[inline]
    pub fn flag(&self, bit: u32) -> bool {
        self.flags & bit != 0
    }
}

/// Peek the (possibly byte-swapped) magic at `offset`.
pub fn peek_magic(bytes: &[u8], offset: usize) -> error::Result<u32> {
    Ok(bytes.pread_with::<u32>(offset, LE)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scroll::Pwrite;

    #[test]
    fn sniffs_width_and_endianness() {
        let mut bytes = [0u8; SIZEOF_HEADER_64];
        bytes
            .pwrite_with(
                Header64 {
                    magic: MH_MAGIC_64,
                    cputype: crate::mach::constants::cputype::CPU_TYPE_X86_64,
                    filetype: MH_DYLIB,
                    ncmds: 3,
                    sizeofcmds: 0x200,
                    flags: MH_DYLDLINK | MH_TWOLEVEL | MH_PIE,
                    ..Default::default()
                },
                0,
                LE,
            )
            .unwrap();
        let (header, ctx) = Header::parse(&bytes, 0).unwrap();
        assert_eq!(ctx.container, Container::Big);
        assert_eq!(ctx.le, LE);
        assert_eq!(header.ncmds, 3);
        assert!(header.flag(MH_PIE));
        assert_eq!(filetype_to_str(header.filetype), "DYLIB");
    }

    #[test]
    fn rejects_garbage_magic() {
        let bytes = [0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0];
        assert!(Header::parse(&bytes, 0).is_err());
    }
}

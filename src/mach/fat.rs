//! A fat (universal) binary concatenates Mach-O slices for several
//! architectures behind a big-endian header; the linker picks the best
//! slice for the host cpu.

use scroll::{BE, Pread, Pwrite, SizeWith};

use crate::error;
use crate::mach::constants::cputype::{self, CpuId};

pub const FAT_MAGIC: u32 = 0xcafe_babe;
pub const FAT_CIGAM: u32 = 0xbeba_feca;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
/// The fat header is always big-endian.
pub struct FatHeader {
    pub magic: u32,
    pub nfat_arch: u32,
}

pub const SIZEOF_FAT_HEADER: usize = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct FatArch {
    pub cputype: u32,
    pub cpusubtype: u32,
    /// File offset of this slice.
    pub offset: u32,
    pub size: u32,
    pub align: u32,
}

pub const SIZEOF_FAT_ARCH: usize = 20;

impl FatHeader {
    pub fn parse(bytes: &[u8]) -> error::Result<FatHeader> {
        Ok(bytes.pread_with::<FatHeader>(0, BE)?)
    }
}

impl FatArch {
    pub fn parse_arches(bytes: &[u8], count: usize) -> error::Result<Vec<FatArch>> {
        let mut arches = Vec::with_capacity(count);
        let mut offset = SIZEOF_FAT_HEADER;
        for _ in 0..count {
            arches.push(bytes.gread_with::<FatArch>(&mut offset, BE)?);
        }
        Ok(arches)
    }

    /// The byte range of this slice, validated against the container.
    pub fn slice_range(&self, file_len: u64) -> error::Result<(u64, u64)> {
        let start = self.offset as u64;
        let end = start + self.size as u64;
        if end > file_len {
            return Err(error::Error::MalformedImage {
                path: Default::default(),
                reason: format!(
                    "fat slice [{:#x}, {:#x}) overruns file of {:#x} bytes",
                    start, end, file_len
                ),
            });
        }
        Ok((start, end))
    }
}

/// Is this (maybe byte-swapped) magic a fat container?
pub fn is_fat_magic(magic: u32) -> bool {
    magic == FAT_MAGIC || magic == FAT_CIGAM
}

/// Choose the best slice for `host` using the static preference table:
/// exact subtype matches win, then subtype-any entries, in table order.
/// `None` when no slice is runnable.
pub fn best_slice(arches: &[FatArch], host: CpuId) -> Option<FatArch> {
    for &(want_type, want_sub) in cputype::slice_preference(host) {
        for arch in arches {
            if arch.cputype != want_type {
                continue;
            }
            let sub = arch.cpusubtype & cputype::CPU_SUBTYPE_MASK;
            if want_sub == cputype::CPU_SUBTYPE_MASK || sub == want_sub {
                return Some(*arch);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mach::constants::cputype::*;
    use scroll::Pwrite;

    fn fat(arches: &[(u32, u32)]) -> Vec<u8> {
        let mut bytes = vec![0u8; SIZEOF_FAT_HEADER + arches.len() * SIZEOF_FAT_ARCH];
        bytes
            .pwrite_with(
                FatHeader {
                    magic: FAT_MAGIC,
                    nfat_arch: arches.len() as u32,
                },
                0,
                BE,
            )
            .unwrap();
        for (i, &(cputype, cpusubtype)) in arches.iter().enumerate() {
            bytes
                .pwrite_with(
                    FatArch {
                        cputype,
                        cpusubtype,
                        offset: 0x1000 * (i as u32 + 1),
                        size: 0x1000,
                        align: 12,
                    },
                    SIZEOF_FAT_HEADER + i * SIZEOF_FAT_ARCH,
                    BE,
                )
                .unwrap();
        }
        bytes
    }

    #[test]
    fn prefers_exact_subtype() {
        let bytes = fat(&[
            (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL),
            (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E),
        ]);
        let header = FatHeader::parse(&bytes).unwrap();
        let arches = FatArch::parse_arches(&bytes, header.nfat_arch as usize).unwrap();

        let best = best_slice(&arches, (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E)).unwrap();
        assert_eq!(best.cpusubtype & CPU_SUBTYPE_MASK, CPU_SUBTYPE_ARM64E);

        // A plain arm64 host skips the arm64e slice.
        let best = best_slice(&arches, (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL)).unwrap();
        assert_eq!(best.cpusubtype & CPU_SUBTYPE_MASK, CPU_SUBTYPE_ARM64_ALL);
    }

    #[test]
    fn no_runnable_slice() {
        let bytes = fat(&[(CPU_TYPE_POWERPC, 0)]);
        let arches = FatArch::parse_arches(&bytes, 1).unwrap();
        assert!(best_slice(&arches, (CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_ALL)).is_none());
    }
}

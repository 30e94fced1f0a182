//! Address-space reservation and per-segment mapping.
//!
//! One image gets one contiguous reservation. Position-independent images
//! slide: the reservation lands wherever the OS puts it, plus a small
//! random pad so consecutive images don't sit at guessable offsets from
//! one another. Non-slideable images must map exactly at their preferred
//! addresses or the load fails.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;

use log::debug;

use crate::error::{Error, Result};
use crate::mach::constants::{SEG_PAGEZERO, VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE};
use crate::mach::load_command;

/// What a segment wants from the mapper, extracted from its load command.
#[derive(Debug, Clone)]
pub struct SegmentLayout {
    pub name: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub initprot: u32,
    pub maxprot: u32,
}

impl SegmentLayout {
    pub fn from_command(seg: &load_command::Segment) -> SegmentLayout {
        SegmentLayout {
            name: seg.name().to_string(),
            vmaddr: seg.vmaddr,
            vmsize: seg.vmsize,
            fileoff: seg.fileoff,
            filesize: seg.filesize,
            initprot: seg.initprot,
            maxprot: seg.maxprot,
        }
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.initprot & VM_PROT_WRITE != 0
    }

    #[inline]
    pub fn is_executable(&self) -> bool {
        self.initprot & VM_PROT_EXECUTE != 0
    }

    #[inline]
    pub fn is_accessible(&self) -> bool {
        self.initprot != 0
    }
}

/// Where the bytes come from.
pub enum Backing<'a> {
    /// An open file plus the offset of the chosen slice within it.
    File { file: &'a File, slice_offset: u64 },
    /// An image already sitting in memory (NSCreateObjectFileImageFromMemory
    /// style loads).
    Memory(&'a [u8]),
}

/// One mapped segment.
#[derive(Debug, Clone)]
pub struct MappedSegment {
    pub name: String,
    /// Actual (slid) base address.
    pub address: u64,
    pub vmsize: u64,
    pub initprot: u32,
    pub maxprot: u32,
    /// Write permission was added on top of `initprot` until fix-ups
    /// complete.
    pub fixup_writable: bool,
}

impl MappedSegment {
    #[inline]
    pub fn end(&self) -> u64 {
        self.address + self.vmsize
    }

    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.address && addr < self.end()
    }

    #[inline]
    pub fn is_accessible(&self) -> bool {
        self.initprot != 0
    }
}

/// An image's reservation and its mapped segments. Unmapped on drop
/// unless [`leak`](Mapping::leak) was called (shared-cache mappings and
/// leave-mapped-on-unload images).
#[derive(Debug)]
pub struct Mapping {
    reservation: u64,
    reservation_size: u64,
    slide: i64,
    segments: Vec<MappedSegment>,
    leaked: bool,
}

pub fn page_size() -> u64 {
    // SAFETY: sysconf is always callable.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}

#[inline]
fn round_up(value: u64, page: u64) -> u64 {
    (value + page - 1) & !(page - 1)
}

impl Mapping {
    /// Map `layouts` from `backing`. When `slideable`, the OS picks the
    /// base and `entropy` decides a 0–3 page pad; otherwise every segment
    /// must land at its preferred address.
    pub fn map(
        path: &Path,
        backing: Backing<'_>,
        layouts: &[SegmentLayout],
        slideable: bool,
        entropy: u64,
    ) -> Result<Mapping> {
        let page = page_size();
        // __PAGEZERO belongs to the kernel's mapping of the main
        // executable; it is never materialized here.
        let mapped: Vec<&SegmentLayout> = layouts
            .iter()
            .filter(|l| l.vmsize > 0 && l.name != SEG_PAGEZERO)
            .collect();
        if mapped.is_empty() {
            return Err(Error::MalformedImage {
                path: path.to_path_buf(),
                reason: "no mappable segments".into(),
            });
        }
        let lowest = mapped.iter().map(|l| l.vmaddr).min().unwrap();
        let highest = mapped
            .iter()
            .map(|l| round_up(l.vmaddr + l.vmsize, page))
            .max()
            .unwrap();
        let span = highest - lowest;

        let (reservation, reservation_size, base) = if slideable {
            let pad = (entropy % 4) * page;
            let size = span + pad;
            let addr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size as usize,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if addr == libc::MAP_FAILED {
                return Err(Error::AddressSpaceBusy {
                    path: path.to_path_buf(),
                    segment: mapped[0].name.clone(),
                    vmaddr: lowest,
                });
            }
            (addr as u64, size, addr as u64 + pad)
        } else {
            // Must land exactly at the preferred base: map without FIXED
            // and verify the kernel honored the hint.
            let addr = unsafe {
                libc::mmap(
                    lowest as *mut libc::c_void,
                    span as usize,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if addr == libc::MAP_FAILED {
                return Err(Error::AddressSpaceBusy {
                    path: path.to_path_buf(),
                    segment: mapped[0].name.clone(),
                    vmaddr: lowest,
                });
            }
            if addr as u64 != lowest {
                unsafe { libc::munmap(addr, span as usize) };
                return Err(Error::AddressSpaceBusy {
                    path: path.to_path_buf(),
                    segment: mapped[0].name.clone(),
                    vmaddr: lowest,
                });
            }
            (addr as u64, span, addr as u64)
        };
        let slide = base as i64 - lowest as i64;

        let mut mapping = Mapping {
            reservation,
            reservation_size,
            slide,
            segments: Vec::with_capacity(mapped.len()),
            leaked: false,
        };

        for layout in mapped {
            let target = (layout.vmaddr as i64 + slide) as u64;
            let vm_span = round_up(layout.vmsize, page);
            if let Err(e) = map_one(&backing, layout, target, vm_span, page) {
                debug!(target: "segments", "failed to map {} of {:?}: {}", layout.name, path, e);
                return Err(e);
            }
            debug!(
                target: "segments",
                "{:>12} of {:?} at {:#x}..{:#x} prot {}{}{}",
                layout.name,
                path.file_name().unwrap_or_default(),
                target,
                target + layout.vmsize,
                if layout.initprot & VM_PROT_READ != 0 { "r" } else { "-" },
                if layout.initprot & VM_PROT_WRITE != 0 { "w" } else { "-" },
                if layout.initprot & VM_PROT_EXECUTE != 0 { "x" } else { "-" },
            );
            mapping.segments.push(MappedSegment {
                name: layout.name.clone(),
                address: target,
                vmsize: layout.vmsize,
                initprot: layout.initprot,
                maxprot: layout.maxprot,
                fixup_writable: false,
            });
        }
        Ok(mapping)
    }

    /// Adopt segments that are already mapped (images inside the shared
    /// cache); nothing is unmapped on drop.
    pub fn preexisting(segments: Vec<MappedSegment>, slide: i64) -> Mapping {
        Mapping {
            reservation: segments.first().map(|s| s.address).unwrap_or(0),
            reservation_size: 0,
            slide,
            segments,
            leaked: true,
        }
    }

    /// Difference between where the image sits and where it preferred to.
    #[inline]
    pub fn slide(&self) -> i64 {
        self.slide
    }

    pub fn segments(&self) -> &[MappedSegment] {
        &self.segments
    }

    /// Lowest mapped address.
    pub fn base_address(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.address)
            .min()
            .unwrap_or(self.reservation)
    }

    /// Keep the pages mapped past this object's life.
    pub fn leak(&mut self) {
        self.leaked = true;
    }

    /// Grant write on a segment (and remember that we did) so fix-ups can
    /// store through it.
    pub fn make_writable(&mut self, index: usize) -> Result<()> {
        let page = page_size();
        let seg = &mut self.segments[index];
        if seg.initprot & VM_PROT_WRITE != 0 || seg.fixup_writable {
            return Ok(());
        }
        protect(seg.address, round_up(seg.vmsize, page), seg.initprot | VM_PROT_WRITE)?;
        seg.fixup_writable = true;
        Ok(())
    }

    /// Restore the protections declared in the file after fix-ups, and
    /// invalidate the instruction cache for executable segments where the
    /// architecture requires it.
    pub fn restore_protections(&mut self) -> Result<()> {
        let page = page_size();
        for seg in &mut self.segments {
            if seg.fixup_writable {
                protect(seg.address, round_up(seg.vmsize, page), seg.initprot)?;
                seg.fixup_writable = false;
                if seg.initprot & VM_PROT_EXECUTE != 0 {
                    invalidate_icache(seg.address, seg.vmsize);
                }
            }
        }
        Ok(())
    }

    /// Store a pointer-sized value at `addr`. The caller guarantees `addr`
    /// came from a bounds-checked fix-up record inside this mapping.
    pub fn write_pointer(&self, addr: u64, value: u64, word_size: usize) {
        debug_assert!(self.segments.iter().any(|s| s.contains(addr)));
        unsafe {
            if word_size == 8 {
                std::ptr::write_volatile(addr as *mut u64, value);
            } else {
                std::ptr::write_volatile(addr as *mut u32, value as u32);
            }
        }
    }

    pub fn read_pointer(&self, addr: u64, word_size: usize) -> u64 {
        debug_assert!(self.segments.iter().any(|s| s.contains(addr)));
        unsafe {
            if word_size == 8 {
                std::ptr::read_volatile(addr as *const u64)
            } else {
                u64::from(std::ptr::read_volatile(addr as *const u32))
            }
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if !self.leaked && self.reservation_size > 0 {
            unsafe {
                libc::munmap(
                    self.reservation as *mut libc::c_void,
                    self.reservation_size as usize,
                );
            }
        }
    }
}

fn prot_to_native(prot: u32) -> i32 {
    let mut native = 0;
    if prot & VM_PROT_READ != 0 {
        native |= libc::PROT_READ;
    }
    if prot & VM_PROT_WRITE != 0 {
        native |= libc::PROT_WRITE;
    }
    if prot & VM_PROT_EXECUTE != 0 {
        native |= libc::PROT_EXEC;
    }
    native
}

fn protect(addr: u64, size: u64, prot: u32) -> Result<()> {
    let rc = unsafe {
        libc::mprotect(addr as *mut libc::c_void, size as usize, prot_to_native(prot))
    };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn map_one(
    backing: &Backing<'_>,
    layout: &SegmentLayout,
    target: u64,
    vm_span: u64,
    page: u64,
) -> Result<()> {
    let file_span = round_up(layout.filesize, page);
    match backing {
        Backing::File { file, slice_offset } if layout.filesize > 0 => {
            let addr = unsafe {
                libc::mmap(
                    target as *mut libc::c_void,
                    file_span as usize,
                    prot_to_native(layout.initprot | VM_PROT_READ),
                    libc::MAP_PRIVATE | libc::MAP_FIXED,
                    file.as_raw_fd(),
                    (slice_offset + layout.fileoff) as libc::off_t,
                )
            };
            if addr == libc::MAP_FAILED {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            // Zero the tail of the last file page beyond filesize.
            if layout.filesize < file_span && layout.initprot & VM_PROT_WRITE != 0 {
                unsafe {
                    std::ptr::write_bytes(
                        (target + layout.filesize) as *mut u8,
                        0,
                        (file_span - layout.filesize) as usize,
                    );
                }
            }
        }
        Backing::Memory(bytes) if layout.filesize > 0 => {
            let start = layout.fileoff as usize;
            let end = start + layout.filesize as usize;
            if end > bytes.len() {
                return Err(crate::linkedit::malformed(&format!(
                    "segment {} file range {:#x}..{:#x} outside in-memory image",
                    layout.name, start, end
                )));
            }
            protect(target, file_span, VM_PROT_READ | VM_PROT_WRITE)?;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytes[start..end].as_ptr(),
                    target as *mut u8,
                    layout.filesize as usize,
                );
            }
            protect(target, file_span, layout.initprot)?;
        }
        _ => {}
    }
    // Zero-fill pages past the file-backed span come straight from the
    // anonymous reservation; give them the segment's protection.
    if vm_span > file_span {
        protect(target + file_span, vm_span - file_span, layout.initprot)?;
    }
    Ok(())
}

/// Instruction-cache invalidation after writing into executable pages.
/// On hosted and unified-cache targets this is a no-op.
#[inline]
pub fn invalidate_icache(_addr: u64, _len: u64) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn layouts(page: u64) -> Vec<SegmentLayout> {
        vec![
            SegmentLayout {
                name: "__TEXT".into(),
                vmaddr: 0,
                vmsize: page,
                fileoff: 0,
                filesize: page,
                initprot: VM_PROT_READ,
                maxprot: VM_PROT_READ | VM_PROT_EXECUTE,
            },
            SegmentLayout {
                name: "__DATA".into(),
                vmaddr: page,
                vmsize: page * 2,
                fileoff: page,
                filesize: page,
                initprot: VM_PROT_READ | VM_PROT_WRITE,
                maxprot: VM_PROT_READ | VM_PROT_WRITE,
            },
        ]
    }

    #[test]
    fn maps_slid_image_from_file() {
        let page = page_size();
        let mut file = tempfile::tempfile().unwrap();
        let mut content = vec![0u8; (page * 2) as usize];
        content[0..4].copy_from_slice(b"TEXT");
        content[page as usize..page as usize + 4].copy_from_slice(b"DATA");
        file.write_all(&content).unwrap();

        let mapping = Mapping::map(
            Path::new("/tmp/test.dylib"),
            Backing::File {
                file: &file,
                slice_offset: 0,
            },
            &layouts(page),
            true,
            3,
        )
        .unwrap();

        // Preferred base was 0, so slide == actual base.
        assert_ne!(mapping.slide(), 0);
        let text = &mapping.segments()[0];
        let data = &mapping.segments()[1];
        assert_eq!(text.address as i64, mapping.slide());
        assert_eq!(data.address, text.address + page);
        let word = unsafe { std::slice::from_raw_parts(text.address as *const u8, 4) };
        assert_eq!(word, b"TEXT");
        // The zero-fill tail reads as zeros and is writable.
        let tail = data.address + page;
        assert_eq!(mapping.read_pointer(tail, 8), 0);
        mapping.write_pointer(tail, 0x1122_3344, 8);
        assert_eq!(mapping.read_pointer(tail, 8), 0x1122_3344);
    }

    #[test]
    fn maps_memory_backed_image() {
        let page = page_size();
        let mut content = vec![0u8; (page * 2) as usize];
        content[(page + 8) as usize] = 0xaa;
        let mapping = Mapping::map(
            Path::new("/tmp/mem.bundle"),
            Backing::Memory(&content),
            &layouts(page),
            true,
            0,
        )
        .unwrap();
        let data = &mapping.segments()[1];
        assert_eq!(mapping.read_pointer(data.address + 8, 8) & 0xff, 0xaa);
    }

    #[test]
    fn fixup_write_toggle() {
        let page = page_size();
        let file = {
            let mut f = tempfile::tempfile().unwrap();
            f.write_all(&vec![0u8; (page * 2) as usize]).unwrap();
            f
        };
        let mut mapping = Mapping::map(
            Path::new("/tmp/test.dylib"),
            Backing::File {
                file: &file,
                slice_offset: 0,
            },
            &layouts(page),
            true,
            0,
        )
        .unwrap();
        // __TEXT is read-only until fix-up write access is granted.
        mapping.make_writable(0).unwrap();
        let text_base = mapping.segments()[0].address;
        mapping.write_pointer(text_base + 16, 0xdead_beef, 8);
        assert_eq!(mapping.read_pointer(text_base + 16, 8), 0xdead_beef);
        mapping.restore_protections().unwrap();
        assert!(!mapping.segments()[0].fixup_writable);
    }
}

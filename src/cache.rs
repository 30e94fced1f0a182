//! The shared-cache consumer: locates the prebuilt cache for the host
//! architecture, maps its three regions, applies the ASLR slide to the
//! data region through the slide-info bitmap, and advertises the dylibs
//! packed inside it.

use std::fs::File;
use std::path::{Path, PathBuf};

use log::{debug, info};
use plain::Plain;

use crate::context::SharedRegionMode;
use crate::error::{Error, Result};
use crate::image::{Image, ImageFlags, LoadOptions};
use crate::mach::constants::{VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE};
use crate::segment::{self, MappedSegment, Mapping, SegmentLayout};

pub const CACHE_MAGIC_PREFIX: &str = "dyld_v1";
pub const CACHE_BASE_NAME: &str = "dyld_shared_cache_";
/// The cache always carries exactly three mappings: RX text, RW data,
/// RO linkedit, in that order.
pub const CACHE_MAPPING_COUNT: u32 = 3;
/// Slide-info bitmap granule.
pub const SLIDE_BITMAP_SIZE: usize = 128;
const SLIDE_PAGE_SIZE: usize = 4096;

/// The fixed-layout file header. Mapped bytes are reinterpreted in
/// place, so the layout must match the builder exactly.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheHeader {
    /// e.g. `dyld_v1  x86_64`.
    pub magic: [u8; 16],
    pub mapping_offset: u32,
    pub mapping_count: u32,
    pub images_offset: u32,
    pub images_count: u32,
    pub dyld_base_address: u64,
    pub code_signature_offset: u64,
    pub code_signature_size: u64,
    pub slide_info_offset: u64,
    pub slide_info_size: u64,
    pub local_symbols_offset: u64,
    pub local_symbols_size: u64,
    pub uuid: [u8; 16],
}

// SAFETY: plain-old-data with no padding surprises; all fields are
// unconditionally valid for any bit pattern.
unsafe impl Plain for CacheHeader {}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheMappingInfo {
    pub address: u64,
    pub size: u64,
    pub file_offset: u64,
    pub max_prot: u32,
    pub init_prot: u32,
}

unsafe impl Plain for CacheMappingInfo {}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheImageInfo {
    pub address: u64,
    pub mod_time: u64,
    pub inode: u64,
    pub path_file_offset: u32,
    pub pad: u32,
}

unsafe impl Plain for CacheImageInfo {}

/// Six-word slide-info header, followed by a `u16` TOC and the 128-byte
/// bitmaps.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheSlideInfo {
    pub version: u32,
    pub toc_offset: u32,
    pub toc_count: u32,
    pub entries_offset: u32,
    pub entries_count: u32,
    pub entries_size: u32,
}

unsafe impl Plain for CacheSlideInfo {}

/// One dylib advertised by the cache.
#[derive(Debug, Clone)]
pub struct CachedImage {
    pub path: PathBuf,
    pub unslid_address: u64,
    pub mtime: i64,
    pub inode: u64,
}

/// A mapped shared cache.
pub struct SharedCache {
    pub path: PathBuf,
    pub uuid: [u8; 16],
    slide: i64,
    /// Owns the whole cache reservation.
    mapping: Mapping,
    mappings: Vec<CacheMappingInfo>,
    images: Vec<CachedImage>,
}

/// `<dir>/dyld_shared_cache_<arch>`.
pub fn cache_path_for_arch(dir: &Path, arch_name: &str) -> PathBuf {
    dir.join(format!("{}{}", CACHE_BASE_NAME, arch_name))
}

impl SharedCache {
    /// Map the cache file. `Use` asks for the process-shared region and
    /// falls back to a private mapping; `Private` maps privately
    /// outright; `Avoid` is handled by the caller (no cache at all).
    pub fn map(path: &Path, arch_name: &str, mode: SharedRegionMode) -> Result<SharedCache> {
        debug_assert_ne!(mode, SharedRegionMode::Avoid);
        let file = File::open(path)?;
        let view = unsafe { memmap2::Mmap::map(&file) }.map_err(Error::Io)?;

        let header = read_plain::<CacheHeader>(&view, 0, path)?;
        let magic = std::str::from_utf8(&header.magic)
            .unwrap_or("")
            .trim_end_matches('\0')
            .to_string();
        if !magic.starts_with(CACHE_MAGIC_PREFIX) {
            return Err(Error::CacheMismatch {
                reason: format!("bad cache magic {:?} in {:?}", magic, path),
            });
        }
        if !magic.trim_end().ends_with(arch_name) {
            return Err(Error::CacheMismatch {
                reason: format!("cache {:?} is for {:?}, host needs {}", path, magic, arch_name),
            });
        }
        if header.mapping_count != CACHE_MAPPING_COUNT {
            return Err(Error::CacheMismatch {
                reason: format!("cache declares {} mappings", header.mapping_count),
            });
        }

        let mut mappings = Vec::with_capacity(header.mapping_count as usize);
        for i in 0..header.mapping_count as usize {
            let offset =
                header.mapping_offset as usize + i * std::mem::size_of::<CacheMappingInfo>();
            mappings.push(*read_plain::<CacheMappingInfo>(&view, offset, path)?);
        }

        // One contiguous reservation for the aggregate region; the
        // kernel's placement supplies the ASLR slide. The hosted
        // consumer reads cache text rather than jumping into it, so the
        // text mapping stays non-executable.
        let layouts: Vec<SegmentLayout> = mappings
            .iter()
            .enumerate()
            .map(|(i, m)| SegmentLayout {
                name: match i {
                    0 => "cache.text".into(),
                    1 => "cache.data".into(),
                    _ => "cache.linkedit".into(),
                },
                vmaddr: m.address,
                vmsize: m.size,
                fileoff: m.file_offset,
                filesize: m.size,
                initprot: if m.init_prot & VM_PROT_WRITE != 0 {
                    VM_PROT_READ | VM_PROT_WRITE
                } else {
                    (m.init_prot & !VM_PROT_EXECUTE) | VM_PROT_READ
                },
                maxprot: m.max_prot,
            })
            .collect();
        let mapping = Mapping::map(
            path,
            segment::Backing::File {
                file: &file,
                slice_offset: 0,
            },
            &layouts,
            true,
            0,
        )?;
        let slide = mapping.slide();
        if mode == SharedRegionMode::Use {
            debug!(target: "segments", "shared region unavailable to hosted linker; cache mapped privately");
        }

        // Slide the data region through the two-level bitmap.
        if slide != 0 && header.slide_info_size > 0 {
            apply_slide(
                &view,
                &header,
                &mappings[1],
                slide,
                path,
            )?;
        }

        // Image table.
        let mut images = Vec::with_capacity(header.images_count as usize);
        for i in 0..header.images_count as usize {
            let offset = header.images_offset as usize + i * std::mem::size_of::<CacheImageInfo>();
            let info = *read_plain::<CacheImageInfo>(&view, offset, path)?;
            let path_bytes = view
                .get(info.path_file_offset as usize..)
                .and_then(|rest| rest.split(|&b| b == 0).next())
                .ok_or_else(|| Error::CacheMismatch {
                    reason: format!("image path offset {:#x} outside cache", info.path_file_offset),
                })?;
            images.push(CachedImage {
                path: PathBuf::from(String::from_utf8_lossy(path_bytes).into_owned()),
                unslid_address: info.address,
                mtime: info.mod_time as i64,
                inode: info.inode,
            });
        }
        info!(
            target: "libraries",
            "mapped shared cache {:?}: {} images, slide {:#x}",
            path,
            images.len(),
            slide
        );

        Ok(SharedCache {
            path: path.to_path_buf(),
            uuid: header.uuid,
            slide,
            mapping,
            mappings,
            images,
        })
    }

    #[inline]
    pub fn slide(&self) -> i64 {
        self.slide
    }

    pub fn images(&self) -> &[CachedImage] {
        &self.images
    }

    pub fn image_by_path(&self, path: &Path) -> Option<&CachedImage> {
        self.images.iter().find(|image| image.path == path)
    }

    pub fn image_by_inode(&self, inode: u64) -> Option<&CachedImage> {
        self.images.iter().find(|image| image.inode == inode)
    }

    /// Is `addr` inside the mapped cache region?
    pub fn contains_address(&self, addr: u64) -> bool {
        self.mappings
            .iter()
            .any(|m| addr >= (m.address as i64 + self.slide) as u64
                && addr < (m.address as i64 + self.slide) as u64 + m.size)
    }

    /// The libsystem reference UUID must match the mapped cache.
    pub fn validate_uuid(&self, expected: &[u8; 16]) -> Result<()> {
        if &self.uuid != expected {
            return Err(Error::CacheMismatch {
                reason: format!(
                    "cache uuid {:02x?} does not match libsystem reference {:02x?}",
                    self.uuid, expected
                ),
            });
        }
        Ok(())
    }

    /// Build an [`Image`] backed by the cache pages for the dylib at
    /// `path`. Cache images never unload and skip GC.
    pub fn instantiate_image(&self, path: &Path, opts: &LoadOptions) -> Result<Image> {
        let info = self.image_by_path(path).ok_or_else(|| Error::MissingLibrary {
            name: path.display().to_string(),
            referenced_from: self.path.clone(),
            reason: "not in shared cache".into(),
        })?;
        let slid = (info.unslid_address as i64 + self.slide) as u64;
        // The header is readable up to the end of the text mapping.
        let text = &self.mappings[0];
        let text_end = (text.address as i64 + self.slide) as u64 + text.size;
        let limit = (text_end - slid) as usize;
        // SAFETY: [slid, text_end) lies inside our own mapping.
        let header_bytes = unsafe { std::slice::from_raw_parts(slid as *const u8, limit) };
        let mach = crate::mach::MachFile::parse(header_bytes, opts.host)
            .map_err(|e| crate::image::attach(e, path))?;
        let segments: Vec<MappedSegment> = mach
            .segments
            .iter()
            .filter(|seg| seg.vmsize > 0)
            .map(|seg| MappedSegment {
                name: seg.name().to_string(),
                address: (seg.vmaddr as i64 + self.slide) as u64,
                vmsize: seg.vmsize,
                initprot: seg.initprot,
                maxprot: seg.maxprot,
                fixup_writable: false,
            })
            .collect();
        let mapping = Mapping::preexisting(segments, self.slide);
        Image::load_from_cache(
            path,
            header_bytes,
            mapping,
            info.mtime,
            info.inode,
            opts,
        )
    }
}

fn read_plain<'a, T: Plain>(bytes: &'a [u8], offset: usize, path: &Path) -> Result<&'a T> {
    let end = offset + std::mem::size_of::<T>();
    if end > bytes.len() {
        return Err(Error::CacheMismatch {
            reason: format!(
                "cache {:?} truncated: need {:#x} bytes, have {:#x}",
                path,
                end,
                bytes.len()
            ),
        });
    }
    plain::from_bytes(&bytes[offset..end]).map_err(|_| Error::CacheMismatch {
        reason: format!("misaligned cache structure at {:#x}", offset),
    })
}

/// Walk the slide-info table and add the slide to every marked 32-bit
/// word of the (already mapped, writable) data region.
fn apply_slide(
    view: &[u8],
    header: &CacheHeader,
    data_mapping: &CacheMappingInfo,
    slide: i64,
    path: &Path,
) -> Result<()> {
    let info_offset = header.slide_info_offset as usize;
    let info = read_plain::<CacheSlideInfo>(view, info_offset, path)?;
    if info.version != 1 {
        return Err(Error::CacheMismatch {
            reason: format!("unsupported slide-info version {}", info.version),
        });
    }
    if info.entries_size as usize != SLIDE_BITMAP_SIZE {
        return Err(Error::CacheMismatch {
            reason: format!("slide-info entry size {} != {}", info.entries_size, SLIDE_BITMAP_SIZE),
        });
    }
    let toc_start = info_offset + info.toc_offset as usize;
    let entries_start = info_offset + info.entries_offset as usize;
    let data_base = (data_mapping.address as i64 + slide) as u64;
    let mut applied = 0usize;
    for page in 0..info.toc_count as usize {
        let toc_entry_offset = toc_start + page * 2;
        let entry_index = u16::from_le_bytes(
            view.get(toc_entry_offset..toc_entry_offset + 2)
                .ok_or_else(|| Error::CacheMismatch {
                    reason: "slide-info TOC truncated".into(),
                })?
                .try_into()
                .unwrap(),
        ) as usize;
        let bitmap_offset = entries_start + entry_index * SLIDE_BITMAP_SIZE;
        let bitmap = view
            .get(bitmap_offset..bitmap_offset + SLIDE_BITMAP_SIZE)
            .ok_or_else(|| Error::CacheMismatch {
                reason: "slide-info bitmap truncated".into(),
            })?;
        let page_base = data_base + (page * SLIDE_PAGE_SIZE) as u64;
        for (byte_index, &byte) in bitmap.iter().enumerate() {
            if byte == 0 {
                continue;
            }
            for bit in 0..8 {
                if byte & (1 << bit) == 0 {
                    continue;
                }
                let site = page_base + ((byte_index * 8 + bit) * 4) as u64;
                // SAFETY: site lies inside the writable data mapping.
                unsafe {
                    let p = site as *mut u32;
                    p.write(p.read().wrapping_add(slide as u32));
                }
                applied += 1;
            }
        }
    }
    debug!(target: "rebasings", "slid {} cache data pointers by {:#x}", applied, slide);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_paths_carry_arch() {
        assert_eq!(
            cache_path_for_arch(Path::new("/var/db/dyld"), "x86_64h"),
            PathBuf::from("/var/db/dyld/dyld_shared_cache_x86_64h")
        );
    }
}

//! The per-image state machine.
//!
//! An [`Image`] is one Mach-O file projected into the address space:
//! its identity on disk, where its segments landed, its dependency table,
//! reference counts, and the monotonic link state (`mapped` →
//! `dependents-mapped` → `rebased` → `bound` → `initialized`). The
//! orchestrator drives the recursive phases; the operations here are the
//! per-image steps they compose.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use log::debug;
use scroll::Pread;

use crate::container::Ctx;
use crate::error::{Error, PackedVersion, Result};
use crate::linkedit::bind::{self, BindRecord, WeakBindCursor};
use crate::linkedit::exports::{Export, ExportInfo, ExportTrie};
use crate::linkedit::rebase::{self, REBASE_TYPE_POINTER, REBASE_TYPE_TEXT_ABSOLUTE32};
use crate::linkedit::SegmentSpan;
use crate::mach::constants::{
    S_DTRACE_DOF, S_INTERPOSING, S_LAZY_SYMBOL_POINTERS, S_MOD_INIT_FUNC_POINTERS,
    S_MOD_TERM_FUNC_POINTERS, S_NON_LAZY_SYMBOL_POINTERS, SECT_INTERPOSE, VM_PROT_WRITE,
};
use crate::mach::cputype::CpuId;
use crate::mach::load_command::{DyldInfoCommand, DysymtabCommand, SymtabCommand};
use crate::mach::relocation::{self, GENERIC_RELOC_VANILLA};
use crate::mach::symbols::{self, Nlist, Symbols};
use crate::mach::{self, DepKind, Entry, MachFile, header};
use crate::segment::{Backing, Mapping, SegmentLayout};

/// Stable handle for an image in the registry graph.
pub type ImageId = petgraph::stable_graph::NodeIndex;

/// The monotonic link state. The numeric values are the ones debuggers
/// see in state-change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ImageState {
    Mapped = 10,
    DependentsMapped = 20,
    Rebased = 30,
    Bound = 40,
    DependentsInitialized = 45,
    Initialized = 50,
    Terminated = 60,
}

/// What kind of file this image came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Executable,
    Dylib,
    Bundle,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ImageFlags: u32 {
        /// RTLD_LOCAL: exports invisible to flat lookups.
        const HIDE_EXPORTS        = 1 << 0;
        const NEVER_UNLOAD        = 1 << 1;
        /// Unmapping is skipped on unload (but terminators still run).
        const LEAVE_MAPPED        = 1 << 2;
        const IN_SHARED_CACHE     = 1 << 3;
        const POSITION_INDEPENDENT = 1 << 4;
        const PREBOUND            = 1 << 5;
        const HAS_WEAK_DEFS       = 1 << 6;
        const BINDS_TO_WEAK       = 1 << 7;
        const HAS_TERMINATORS     = 1 << 8;
        const HAS_INITIALIZERS    = 1 << 9;
        /// Loaded via the insert-libraries environment control.
        const INSERTED            = 1 << 10;
        /// This on-disk image shadows a copy in the shared cache.
        const CACHE_OVERRIDE      = 1 << 11;
    }
}

/// One row of the dependency table, in load-command order (bind ordinals
/// are 1-based indices into this table).
#[derive(Debug, Clone)]
pub struct Dependency {
    pub name: String,
    pub kind: DepKind,
    pub compat_version: PackedVersion,
    pub current_version: PackedVersion,
    /// Filled in as dependents load; stays `None` for a missing weak
    /// dependency.
    pub image: Option<ImageId>,
}

/// Which LINKEDIT style the image uses; offsets are rebased to the start
/// of the mapped LINKEDIT segment.
#[derive(Debug)]
pub enum LinkEdit {
    Compressed(DyldInfoCommand),
    Classic {
        symtab: SymtabCommand,
        dysymtab: DysymtabCommand,
    },
}

/// A run of pointers in a section (initializers, terminators).
#[derive(Debug, Clone, Copy)]
pub struct PointerRun {
    /// Actual (slid) address of the first pointer.
    pub address: u64,
    pub count: usize,
}

/// The maximum depth value; the initial cycle-break assignment.
pub const MAX_DEPTH: u32 = u32::MAX;

pub struct Image {
    // Identity.
    pub path: PathBuf,
    /// Alias the image was requested under (symlinked install name).
    pub logical_path: Option<PathBuf>,
    pub device: u64,
    pub inode: u64,
    pub mtime: i64,
    /// Offset of the chosen slice inside a universal container.
    pub slice_offset: u64,
    pub uuid: Option<[u8; 16]>,
    pub install_name: Option<String>,
    pub compat_version: PackedVersion,
    pub current_version: PackedVersion,

    // Layout.
    pub kind: ImageKind,
    pub ctx: Ctx,
    pub mapping: Mapping,
    /// Spans of every load-command segment (the opcode streams' segment
    /// index space), whether or not it was materialized.
    seg_spans: Vec<SegmentSpan>,
    linkedit_addr: u64,
    linkedit_size: u64,
    /// `(address, count, first indirect-table index)` of the symbol
    /// pointer sections classic binding walks.
    symbol_pointer_runs: Vec<(u64, usize, usize)>,

    // Linking inputs.
    pub linkedit: LinkEdit,
    pub deps: Vec<Dependency>,
    pub rpaths: Vec<String>,
    pub sub_umbrellas: Vec<String>,
    pub sub_libraries: Vec<String>,
    pub sub_framework_parent: Option<String>,

    // Initializers and friends.
    pub init_runs: Vec<PointerRun>,
    pub term_runs: Vec<PointerRun>,
    /// `LC_ROUTINES*` entry, already slid.
    pub routines_init: Option<u64>,
    /// Entry point of a main executable, already slid.
    pub entry: Option<u64>,
    /// `(address, size)` of `__interpose` sections, already slid.
    pub interpose_runs: Vec<(u64, u64)>,
    /// `(address, size)` of dtrace DOF sections, already slid.
    pub dof_runs: Vec<(u64, u64)>,

    // Linking state.
    pub state: ImageState,
    pub depth: u32,
    pub flags: ImageFlags,
    pub static_ref_count: u32,
    pub dynamic_ref_count: u32,
    pub open_count: u32,
    /// GC mark bit, meaningful only inside a collection.
    pub gc_live: bool,

    init_lock: InitLock,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("path", &self.path)
            .field("state", &self.state)
            .field("slide", &self.mapping.slide())
            .field("deps", &self.deps.len())
            .finish()
    }
}

/// Everything the constructors need to know about the load.
pub struct LoadOptions {
    pub host: CpuId,
    /// ASLR entropy, consumed by pad selection.
    pub entropy: u64,
    /// Flags the load context already knows (inserted, hide-exports, …).
    pub flags: ImageFlags,
}

impl Image {
    /// `load-from-file`: sniff, choose the host slice, map segments, and
    /// populate identity from the file's stat.
    pub fn load_from_file(
        path: &Path,
        file: &File,
        meta: &std::fs::Metadata,
        opts: &LoadOptions,
    ) -> Result<Image> {
        let view = unsafe { memmap2::Mmap::map(file) }.map_err(Error::Io)?;
        let (slice_offset, slice_len) = mach::find_host_slice(&view, opts.host)
            .map_err(|e| attach(e, path))?;
        let slice = &view[slice_offset..slice_offset + slice_len];
        let mach = MachFile::parse(slice, opts.host).map_err(|e| attach(e, path))?;

        let kind = kind_of(&mach)?;
        let slideable = match kind {
            ImageKind::Executable => mach.header.flag(header::MH_PIE),
            _ => true,
        };
        let layouts: Vec<SegmentLayout> = mach
            .segments
            .iter()
            .map(SegmentLayout::from_command)
            .collect();
        let mapping = Mapping::map(
            path,
            Backing::File {
                file,
                slice_offset: slice_offset as u64,
            },
            &layouts,
            slideable,
            opts.entropy,
        )?;

        use std::os::unix::fs::MetadataExt;
        let mut image = Image::assemble(path, mach, mapping, kind, opts)?;
        image.device = meta.dev();
        image.inode = meta.ino();
        image.mtime = meta.mtime();
        image.slice_offset = slice_offset as u64;
        Ok(image)
    }

    /// `load-from-memory`: an image delivered as bytes (bundles created
    /// from memory); identity fields stay zero.
    pub fn load_from_memory(name: &Path, bytes: &[u8], opts: &LoadOptions) -> Result<Image> {
        let (slice_offset, slice_len) =
            mach::find_host_slice(bytes, opts.host).map_err(|e| attach(e, name))?;
        let slice = &bytes[slice_offset..slice_offset + slice_len];
        let mach = MachFile::parse(slice, opts.host).map_err(|e| attach(e, name))?;
        let kind = kind_of(&mach)?;
        let layouts: Vec<SegmentLayout> = mach
            .segments
            .iter()
            .map(SegmentLayout::from_command)
            .collect();
        let mapping = Mapping::map(name, Backing::Memory(slice), &layouts, true, opts.entropy)?;
        Image::assemble(name, mach, mapping, kind, opts)
    }

    /// `load-from-cache`: the segments already sit inside the mapped
    /// shared region; only bookkeeping is created.
    pub fn load_from_cache(
        path: &Path,
        header_bytes: &[u8],
        mapping: Mapping,
        mtime: i64,
        inode: u64,
        opts: &LoadOptions,
    ) -> Result<Image> {
        let mach = MachFile::parse(header_bytes, opts.host).map_err(|e| attach(e, path))?;
        let kind = kind_of(&mach)?;
        let mut image = Image::assemble(path, mach, mapping, kind, opts)?;
        image.mtime = mtime;
        image.inode = inode;
        image.flags |= ImageFlags::IN_SHARED_CACHE | ImageFlags::NEVER_UNLOAD;
        Ok(image)
    }

    fn assemble(
        path: &Path,
        mach: MachFile<'_>,
        mapping: Mapping,
        kind: ImageKind,
        opts: &LoadOptions,
    ) -> Result<Image> {
        let slide = mapping.slide();
        // Spans for every load-command segment, in command order; this is
        // the index space the opcode streams use.
        let mut seg_spans = Vec::with_capacity(mach.segments.len());
        for seg in &mach.segments {
            seg_spans.push(SegmentSpan {
                address: (seg.vmaddr as i64 + slide) as u64,
                size: seg.vmsize,
            });
        }

        let linkedit_seg = mach.linkedit_segment();
        let (linkedit_addr, linkedit_size, linkedit_fileoff) = match linkedit_seg {
            Some(seg) => (
                (seg.vmaddr as i64 + slide) as u64,
                seg.filesize,
                seg.fileoff,
            ),
            None => (0, 0, 0),
        };

        // Rebase every LINKEDIT file offset to the mapped segment base so
        // runtime consumers never see raw file offsets.
        let linkedit = if let Some(info) = mach.dyld_info {
            let rel = |off: u32| -> u32 {
                if off == 0 { 0 } else { off.saturating_sub(linkedit_fileoff as u32) }
            };
            LinkEdit::Compressed(DyldInfoCommand {
                rebase_off: rel(info.rebase_off),
                bind_off: rel(info.bind_off),
                weak_bind_off: rel(info.weak_bind_off),
                lazy_bind_off: rel(info.lazy_bind_off),
                export_off: rel(info.export_off),
                ..info
            })
        } else {
            let mut symtab = mach.symtab.unwrap_or_default();
            let mut dysymtab = mach.dysymtab.unwrap_or_default();
            let rel = |off: u32| -> u32 {
                if off == 0 { 0 } else { off.saturating_sub(linkedit_fileoff as u32) }
            };
            symtab.symoff = rel(symtab.symoff);
            symtab.stroff = rel(symtab.stroff);
            dysymtab.indirectsymoff = rel(dysymtab.indirectsymoff);
            dysymtab.locreloff = rel(dysymtab.locreloff);
            dysymtab.extreloff = rel(dysymtab.extreloff);
            LinkEdit::Classic { symtab, dysymtab }
        };

        let mut flags = opts.flags;
        if mach.header.flag(header::MH_PIE) || kind != ImageKind::Executable {
            flags |= ImageFlags::POSITION_INDEPENDENT;
        }
        if mach.header.flag(header::MH_PREBOUND) {
            flags |= ImageFlags::PREBOUND;
        }
        if mach.header.flag(header::MH_WEAK_DEFINES) {
            flags |= ImageFlags::HAS_WEAK_DEFS;
        }
        if mach.header.flag(header::MH_BINDS_TO_WEAK) {
            flags |= ImageFlags::BINDS_TO_WEAK;
        }

        // Pointer-run sections: initializers, terminators, interposition
        // tuples, dtrace DOF.
        let word = mach.ctx.word_size();
        let mut init_runs = Vec::new();
        let mut term_runs = Vec::new();
        let mut interpose_runs = Vec::new();
        let mut dof_runs = Vec::new();
        let mut symbol_pointer_runs = Vec::new();
        for seg in &mach.segments {
            for sect in &seg.sections {
                let address = (sect.addr as i64 + slide) as u64;
                match sect.section_type() {
                    S_MOD_INIT_FUNC_POINTERS => init_runs.push(PointerRun {
                        address,
                        count: sect.size as usize / word,
                    }),
                    S_MOD_TERM_FUNC_POINTERS => term_runs.push(PointerRun {
                        address,
                        count: sect.size as usize / word,
                    }),
                    S_INTERPOSING => interpose_runs.push((address, sect.size)),
                    S_DTRACE_DOF => dof_runs.push((address, sect.size)),
                    S_LAZY_SYMBOL_POINTERS | S_NON_LAZY_SYMBOL_POINTERS => symbol_pointer_runs
                        .push((address, sect.size as usize / word, sect.reserved1 as usize)),
                    _ => {
                        // The conventional name works even without the
                        // section type flag.
                        if sect.name() == SECT_INTERPOSE {
                            interpose_runs.push((address, sect.size));
                        }
                    }
                }
            }
        }
        if !init_runs.is_empty() || mach.routines_init.is_some() {
            flags |= ImageFlags::HAS_INITIALIZERS;
        }
        if !term_runs.is_empty() {
            flags |= ImageFlags::HAS_TERMINATORS;
        }

        let text_base = mach
            .segments
            .iter()
            .find(|s| s.fileoff == 0 && s.filesize > 0)
            .map(|s| (s.vmaddr as i64 + slide) as u64)
            .unwrap_or_else(|| mapping.base_address());
        let entry = match mach.entry {
            Some(Entry::Main(entryoff)) => Some(text_base + entryoff),
            // LC_UNIXTHREAD carries an absolute pc; it slides with the
            // image.
            Some(Entry::Thread) => None,
            None => None,
        };

        let deps = mach
            .deps
            .iter()
            .map(|dep| Dependency {
                name: dep.name.to_string(),
                kind: dep.kind,
                compat_version: PackedVersion(dep.compat_version),
                current_version: PackedVersion(dep.current_version),
                image: None,
            })
            .collect();

        Ok(Image {
            path: path.to_path_buf(),
            logical_path: None,
            device: 0,
            inode: 0,
            mtime: 0,
            slice_offset: 0,
            uuid: mach.uuid,
            install_name: mach.id.as_ref().map(|id| id.name.to_string()),
            compat_version: PackedVersion(
                mach.id.as_ref().map(|id| id.compat_version).unwrap_or(0),
            ),
            current_version: PackedVersion(
                mach.id.as_ref().map(|id| id.current_version).unwrap_or(0),
            ),
            kind,
            ctx: mach.ctx,
            mapping,
            seg_spans,
            linkedit_addr,
            linkedit_size,
            symbol_pointer_runs,
            linkedit,
            deps,
            rpaths: mach.rpaths.iter().map(|s| s.to_string()).collect(),
            sub_umbrellas: mach.sub_umbrellas.iter().map(|s| s.to_string()).collect(),
            sub_libraries: mach.sub_libraries.iter().map(|s| s.to_string()).collect(),
            sub_framework_parent: mach.sub_framework_parent.map(|s| s.to_string()),
            init_runs,
            term_runs,
            routines_init: mach.routines_init.map(|addr| (addr as i64 + slide) as u64),
            entry,
            interpose_runs,
            dof_runs,
            state: ImageState::Mapped,
            depth: 0,
            flags,
            static_ref_count: 0,
            dynamic_ref_count: 0,
            open_count: 0,
            gc_live: true,
            init_lock: InitLock::new(),
        })
    }

    #[inline]
    pub fn slide(&self) -> i64 {
        self.mapping.slide()
    }

    #[inline]
    pub fn word_size(&self) -> usize {
        self.ctx.word_size()
    }

    #[inline]
    pub fn in_shared_cache(&self) -> bool {
        self.flags.contains(ImageFlags::IN_SHARED_CACHE)
    }

    #[inline]
    pub fn never_unload(&self) -> bool {
        self.flags.contains(ImageFlags::NEVER_UNLOAD)
    }

    pub fn segment_spans(&self) -> &[SegmentSpan] {
        &self.seg_spans
    }

    /// The name the image should be matched by: its install name when it
    /// has one, else its path.
    pub fn identity_name(&self) -> &str {
        self.install_name
            .as_deref()
            .unwrap_or_else(|| self.path.to_str().unwrap_or(""))
    }

    /// Advance the state. States never regress except through
    /// [`rollback_state`](Self::rollback_state) on link failure.
    pub fn set_state(&mut self, state: ImageState) {
        debug_assert!(state >= self.state || state == ImageState::Terminated);
        if state > self.state {
            self.state = state;
        }
    }

    /// Drop back to the state preceding a failed phase.
    pub fn rollback_state(&mut self, state: ImageState) {
        self.state = state;
    }

    ///////////////////////////////////////////
    // LINKEDIT access
    ///////////////////////////////////////////

    /// A view of `size` bytes at `offset` into the mapped LINKEDIT
    /// segment. Offsets here have already been rebased from file offsets.
    fn linkedit_slice(&self, offset: u32, size: u32) -> Result<&[u8]> {
        if size == 0 {
            return Ok(&[]);
        }
        let end = offset as u64 + size as u64;
        if self.linkedit_addr == 0 || end > self.linkedit_size {
            return Err(Error::MalformedImage {
                path: self.path.clone(),
                reason: format!(
                    "linkedit range {:#x}..{:#x} outside segment of {:#x} bytes",
                    offset, end, self.linkedit_size
                ),
            });
        }
        // SAFETY: the range was just bounds-checked against the mapped
        // LINKEDIT segment, which lives as long as `self.mapping`.
        Ok(unsafe {
            std::slice::from_raw_parts((self.linkedit_addr + offset as u64) as *const u8, size as usize)
        })
    }

    pub fn export_trie(&self) -> Result<Option<ExportTrie<'_>>> {
        match &self.linkedit {
            LinkEdit::Compressed(info) if info.export_size > 0 => Ok(Some(ExportTrie::new(
                self.linkedit_slice(info.export_off, info.export_size)?,
            ))),
            _ => Ok(None),
        }
    }

    fn classic_symbols(&self) -> Result<Option<(Symbols<'_>, &DysymtabCommand)>> {
        match &self.linkedit {
            LinkEdit::Classic { symtab, dysymtab } if symtab.nsyms > 0 => {
                let view = self.linkedit_slice(0, self.linkedit_size as u32)?;
                let symbols = Symbols::parse(view, symtab, self.ctx)
                    .map_err(|e| attach(e, &self.path))?;
                Ok(Some((symbols, dysymtab)))
            }
            _ => Ok(None),
        }
    }

    ///////////////////////////////////////////
    // Rebase
    ///////////////////////////////////////////

    /// Apply this image's rebase information (compressed stream or
    /// classic local relocations). Read-only segments containing fix-up
    /// sites get temporary write permission, restored by the caller via
    /// [`finish_fixups`](Self::finish_fixups).
    pub fn apply_rebase(&mut self) -> Result<()> {
        if self.in_shared_cache() {
            // Cache images are pre-rebased for their preferred addresses;
            // the slide-info bitmap already moved them.
            return Ok(());
        }
        let slide = self.slide();
        if slide == 0 {
            // Nothing moved. Stale prebindings are rewritten by the bind
            // phase, not here.
            return Ok(());
        }
        let word = self.word_size();
        let fixups = self.collect_rebase_fixups()?;
        for fixup in &fixups {
            self.make_site_writable(fixup.address)?;
            match fixup.kind {
                REBASE_TYPE_POINTER => {
                    let old = self.mapping.read_pointer(fixup.address, word);
                    self.mapping
                        .write_pointer(fixup.address, (old as i64 + slide) as u64, word);
                }
                REBASE_TYPE_TEXT_ABSOLUTE32 => {
                    let old = self.mapping.read_pointer(fixup.address, 4);
                    self.mapping
                        .write_pointer(fixup.address, (old as i64 + slide) as u64, 4);
                }
                other => {
                    return Err(Error::MalformedRebase {
                        path: self.path.clone(),
                        reason: format!("unsupported rebase type {}", other),
                    });
                }
            }
        }
        debug!(target: "rebasings", "{:?}: applied {} rebases (slide {:#x})", self.path, fixups.len(), slide);
        Ok(())
    }

    fn collect_rebase_fixups(&self) -> Result<Vec<rebase::RebaseFixup>> {
        match &self.linkedit {
            LinkEdit::Compressed(info) => {
                let stream = self.linkedit_slice(info.rebase_off, info.rebase_size)?;
                rebase::fixups(stream, &self.seg_spans, self.word_size() as u64)
                    .map_err(|e| attach(e, &self.path))
            }
            LinkEdit::Classic { dysymtab, .. } => {
                // Classic images rebase through local relocation records,
                // based at the first writable segment.
                let view = self.linkedit_slice(0, self.linkedit_size as u32)?;
                let relocs = relocation::parse(
                    view,
                    dysymtab.locreloff as usize,
                    dysymtab.nlocrel as usize,
                    self.ctx.le,
                )?;
                let base = self
                    .seg_spans
                    .first()
                    .map(|s| s.address)
                    .unwrap_or_default();
                let word = self.word_size() as u64;
                let mut fixups = Vec::with_capacity(relocs.len());
                for reloc in relocs {
                    if reloc.is_scattered() || reloc.r_type() != GENERIC_RELOC_VANILLA {
                        continue;
                    }
                    let address = base + reloc.r_address as u64;
                    if !self.seg_spans.iter().any(|s| s.contains(address))
                        || !self
                            .seg_spans
                            .iter()
                            .any(|s| s.contains(address + word - 1))
                    {
                        return Err(Error::MalformedRebase {
                            path: self.path.clone(),
                            reason: format!("relocation site {:#x} outside image", address),
                        });
                    }
                    fixups.push(rebase::RebaseFixup {
                        address,
                        kind: REBASE_TYPE_POINTER,
                    });
                }
                Ok(fixups)
            }
        }
    }

    /// Restore protections that were widened for fix-ups.
    pub fn finish_fixups(&mut self) -> Result<()> {
        self.mapping.restore_protections()
    }

    fn make_site_writable(&mut self, addr: u64) -> Result<()> {
        let index = self
            .mapping
            .segments()
            .iter()
            .position(|seg| seg.contains(addr));
        if let Some(index) = index {
            if self.mapping.segments()[index].initprot & VM_PROT_WRITE == 0 {
                self.mapping.make_writable(index)?;
            }
        }
        Ok(())
    }

    ///////////////////////////////////////////
    // Bind
    ///////////////////////////////////////////

    /// The non-lazy bind records of a compressed image (classic images
    /// bind through their indirect symbol table, see
    /// [`classic_bind_records`](Self::classic_bind_records)).
    pub fn bind_records(&self) -> Result<Vec<BindRecord<'_>>> {
        match &self.linkedit {
            LinkEdit::Compressed(info) => {
                let stream = self.linkedit_slice(info.bind_off, info.bind_size)?;
                bind::records(stream, &self.seg_spans, self.word_size() as u64)
                    .map_err(|e| attach(e, &self.path))
            }
            LinkEdit::Classic { .. } => Ok(Vec::new()),
        }
    }

    /// The lazy records, for `BIND_AT_LAUNCH` / `force-lazy` binding.
    pub fn lazy_bind_records(&self) -> Result<Vec<(usize, BindRecord<'_>)>> {
        match &self.linkedit {
            LinkEdit::Compressed(info) => {
                let stream = self.linkedit_slice(info.lazy_bind_off, info.lazy_bind_size)?;
                bind::lazy_records(stream, &self.seg_spans, self.word_size() as u64)
                    .map_err(|e| attach(e, &self.path))
            }
            LinkEdit::Classic { .. } => Ok(Vec::new()),
        }
    }

    /// The single lazy record a stub trampoline asked for.
    pub fn lazy_bind_record_at(&self, offset: usize) -> Result<BindRecord<'_>> {
        match &self.linkedit {
            LinkEdit::Compressed(info) => {
                let stream = self.linkedit_slice(info.lazy_bind_off, info.lazy_bind_size)?;
                bind::lazy_record_at(stream, offset, &self.seg_spans, self.word_size() as u64)
                    .map_err(|e| attach(e, &self.path))
            }
            LinkEdit::Classic { .. } => Err(Error::MalformedImage {
                path: self.path.clone(),
                reason: "classic images have no lazy bind stream".into(),
            }),
        }
    }

    /// A cursor over the weak-bind stream, for process-wide coalescing.
    pub fn weak_bind_cursor(&self) -> Result<Option<WeakBindCursor<'_>>> {
        match &self.linkedit {
            LinkEdit::Compressed(info) if info.weak_bind_size > 0 => {
                let stream = self.linkedit_slice(info.weak_bind_off, info.weak_bind_size)?;
                Ok(Some(WeakBindCursor::new(
                    stream,
                    &self.seg_spans,
                    self.word_size() as u64,
                )))
            }
            _ => Ok(None),
        }
    }

    /// Classic binding: walk the lazy/non-lazy pointer sections through
    /// the indirect symbol table and produce the equivalent bind records.
    pub fn classic_bind_records(&self) -> Result<Vec<ClassicBind>> {
        let Some((symbols, dysymtab)) = self.classic_symbols()? else {
            return Ok(Vec::new());
        };
        let view = self.linkedit_slice(0, self.linkedit_size as u32)?;
        let word = self.word_size() as u64;
        let mut out = Vec::new();
        for &(addr, count, indirect_start) in &self.symbol_pointer_runs {
            for i in 0..count {
                let slot = dysymtab.indirectsymoff as usize
                    + (indirect_start + i) * std::mem::size_of::<u32>();
                let sym_index: u32 = view
                    .pread_with(slot, self.ctx.le)
                    .map_err(Error::Scroll)?;
                if sym_index & (symbols::INDIRECT_SYMBOL_LOCAL | symbols::INDIRECT_SYMBOL_ABS) != 0
                {
                    continue;
                }
                let (name, nlist) = symbols.get(sym_index as usize)?;
                if !nlist.is_undefined() {
                    continue;
                }
                let ordinal = match symbols::library_ordinal(nlist.n_desc) {
                    symbols::SELF_LIBRARY_ORDINAL => bind::Ordinal::SelfImage,
                    symbols::EXECUTABLE_ORDINAL => bind::Ordinal::MainExecutable,
                    symbols::DYNAMIC_LOOKUP_ORDINAL => bind::Ordinal::FlatLookup,
                    n => bind::Ordinal::Library(n as u16),
                };
                out.push(ClassicBind {
                    address: addr + i as u64 * word,
                    symbol: name.to_string(),
                    ordinal,
                    weak_import: nlist.is_weak_ref(),
                });
            }
        }
        Ok(out)
    }

    /// The image's header and load commands as mapped.
    pub fn mapped_header_bytes(&self) -> Result<&[u8]> {
        let base = self.mapping.base_address();
        let seg = self
            .mapping
            .segments()
            .iter()
            .find(|s| s.address == base)
            .ok_or_else(|| Error::MalformedImage {
                path: self.path.clone(),
                reason: "no segment at image base".into(),
            })?;
        // SAFETY: the segment is mapped for at least vmsize bytes.
        Ok(unsafe { std::slice::from_raw_parts(base as *const u8, seg.vmsize as usize) })
    }

    /// Write a resolved bind value. `kind` is a `BIND_TYPE_*`.
    pub fn write_bind(&mut self, address: u64, value: u64, kind: u8) -> Result<()> {
        self.make_site_writable(address)?;
        match kind {
            bind::BIND_TYPE_POINTER => {
                let word = self.word_size();
                self.mapping.write_pointer(address, value, word);
            }
            bind::BIND_TYPE_TEXT_ABSOLUTE32 => {
                self.mapping.write_pointer(address, value & 0xffff_ffff, 4);
            }
            bind::BIND_TYPE_TEXT_PCREL32 => {
                let rel = value.wrapping_sub(address + 4) & 0xffff_ffff;
                self.mapping.write_pointer(address, rel, 4);
            }
            other => {
                return Err(Error::MalformedImage {
                    path: self.path.clone(),
                    reason: format!("unsupported bind type {}", other),
                });
            }
        }
        Ok(())
    }

    ///////////////////////////////////////////
    // Exports
    ///////////////////////////////////////////

    /// Look up `name` in this image's own exports. Re-exported symbols
    /// come back as [`OwnExport::Reexport`]; the orchestrator chases them
    /// through the dependency table.
    pub fn find_own_export(&self, name: &str) -> Result<Option<OwnExport>> {
        if let Some(trie) = self.export_trie()? {
            let found = trie.find(name).map_err(|e| attach(e, &self.path))?;
            return Ok(found.map(|export| self.own_export_from_trie(export)));
        }
        if let Some((symbols, dysymtab)) = self.classic_symbols()? {
            let found = symbols.find_in_range(
                name,
                dysymtab.iextdefsym as usize,
                dysymtab.nextdefsym as usize,
            )?;
            if let Some((_, nlist)) = found {
                return Ok(Some(self.own_export_from_nlist(&nlist)));
            }
        }
        Ok(None)
    }

    fn own_export_from_trie(&self, export: Export<'_>) -> OwnExport {
        match export.info {
            ExportInfo::Regular { offset } => OwnExport::Definition {
                address: (self.unslid_base() + offset).wrapping_add(self.slide() as u64),
                weak: export.is_weak(),
            },
            ExportInfo::StubAndResolver { stub_offset, .. } => {
                // Without running resolvers, the stub is the observable
                // definition.
                OwnExport::Definition {
                    address: (self.unslid_base() + stub_offset).wrapping_add(self.slide() as u64),
                    weak: export.is_weak(),
                }
            }
            ExportInfo::Reexport { ordinal, name } => OwnExport::Reexport {
                ordinal: ordinal as u16,
                name: if name.is_empty() {
                    None
                } else {
                    Some(name.to_string())
                },
            },
        }
    }

    fn own_export_from_nlist(&self, nlist: &Nlist) -> OwnExport {
        OwnExport::Definition {
            address: (nlist.n_value as i64 + self.slide()) as u64,
            weak: nlist.is_weak_def(),
        }
    }

    /// Trie offsets are relative to the image's preferred base (the first
    /// mapped segment's unslid address).
    fn unslid_base(&self) -> u64 {
        (self.mapping.base_address() as i64 - self.slide()) as u64
    }

    ///////////////////////////////////////////
    // Initializers and terminators
    ///////////////////////////////////////////

    /// The initializer entry points in call order: the `LC_ROUTINES`
    /// entry first, then every section entry in declaration order.
    pub fn initializers(&self) -> Vec<u64> {
        let word = self.word_size();
        let mut out = Vec::new();
        if let Some(routine) = self.routines_init {
            out.push(routine);
        }
        for run in &self.init_runs {
            for i in 0..run.count {
                let addr = run.address + (i * word) as u64;
                let target = self.mapping.read_pointer(addr, word);
                if target != 0 {
                    out.push(target);
                }
            }
        }
        out
    }

    /// Terminator entry points in reverse declaration order.
    pub fn terminators(&self) -> Vec<u64> {
        let word = self.word_size();
        let mut out = Vec::new();
        for run in &self.term_runs {
            for i in 0..run.count {
                let addr = run.address + (i * word) as u64;
                let target = self.mapping.read_pointer(addr, word);
                if target != 0 {
                    out.push(target);
                }
            }
        }
        out.reverse();
        out
    }

    pub fn init_lock(&self) -> &InitLock {
        &self.init_lock
    }
}

/// What a lookup found in one image, before re-export chasing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnExport {
    Definition { address: u64, weak: bool },
    Reexport { ordinal: u16, name: Option<String> },
}

/// A classic (indirect-symbol-table) bind site.
#[derive(Debug, Clone)]
pub struct ClassicBind {
    pub address: u64,
    pub symbol: String,
    pub ordinal: bind::Ordinal,
    pub weak_import: bool,
}

fn kind_of(mach: &MachFile<'_>) -> Result<ImageKind> {
    Ok(match mach.header.filetype {
        header::MH_EXECUTE => ImageKind::Executable,
        header::MH_DYLIB | header::MH_DYLINKER => ImageKind::Dylib,
        header::MH_BUNDLE => ImageKind::Bundle,
        other => {
            return Err(Error::MalformedImage {
                path: Default::default(),
                reason: format!("filetype {:#x} is not loadable", other),
            });
        }
    })
}

/// Fill the empty path of a lower-layer error with the image's path.
pub(crate) fn attach(err: Error, path: &Path) -> Error {
    match err {
        Error::MalformedImage { path: p, reason } if p.as_os_str().is_empty() => {
            Error::MalformedImage {
                path: path.to_path_buf(),
                reason,
            }
        }
        Error::MalformedRebase { path: p, reason } if p.as_os_str().is_empty() => {
            Error::MalformedRebase {
                path: path.to_path_buf(),
                reason,
            }
        }
        Error::UnsupportedArch { path: p, cputype } if p.as_os_str().is_empty() => {
            Error::UnsupportedArch {
                path: path.to_path_buf(),
                cputype,
            }
        }
        other => other,
    }
}

///////////////////////////////////////////
// Recursive initializer lock
///////////////////////////////////////////

/// The per-image initializer lock: recursive for the owning thread, a
/// spin for everyone else. An explicit `(owner, count)` pair rather than
/// a mutex so a thread that re-enters the linker from its own
/// initializer doesn't deadlock.
pub struct InitLock {
    owner: AtomicU64,
    count: AtomicU32,
}

/// A stable nonzero token for the current thread.
pub fn current_thread_token() -> u64 {
    thread_local! {
        static TOKEN: u8 = const { 0 };
    }
    TOKEN.with(|token| token as *const u8 as u64)
}

impl InitLock {
    pub fn new() -> Self {
        InitLock {
            owner: AtomicU64::new(0),
            count: AtomicU32::new(0),
        }
    }

    /// Acquire for the current thread, spinning while another thread runs
    /// initializers; recursion on the owning thread just bumps the count.
    pub fn acquire(&self) {
        let me = current_thread_token();
        loop {
            match self
                .owner
                .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(current) if current == me => break,
                Err(_) => std::hint::spin_loop(),
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn release(&self) {
        debug_assert_eq!(self.owner.load(Ordering::Relaxed), current_thread_token());
        if self.count.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.owner.store(0, Ordering::Release);
        }
    }
}

impl Default for InitLock {
    fn default() -> Self {
        InitLock::new()
    }
}

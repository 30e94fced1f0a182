//! The Mach-O file-format view: endian- and width-correct accessors over
//! the raw bytes of an image, presenting exactly what the linker consumes:
//! segments, the dependency table, fix-up info offsets, and entry points.

pub mod constants;
pub mod fat;
pub mod header;
pub mod load_command;
pub mod relocation;
pub mod symbols;

pub use self::constants::cputype;

use scroll::Pread;

use crate::container::Ctx;
use crate::error::{self, Error};
use crate::mach::constants::cputype::CpuId;
use crate::mach::header::Header;
use crate::mach::load_command::{CommandVariant, DyldInfoCommand, DysymtabCommand, LinkeditDataCommand, LoadCommandIter, Segment, SymtabCommand, lc_str};

/// Dependency counts and segment counts are bounded so they fit the
/// per-image storage referenced by bind ordinals and opcode immediates.
pub const MAX_DEPENDENTS: usize = 0x0fff;
pub const MAX_SEGMENTS: usize = 0xff;

/// How an image names a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    Regular,
    /// Missing at load time leaves a null slot instead of failing.
    Weak,
    /// The dependency's exports are republished as this image's.
    Reexport,
    /// Edge is ignored for initializer ordering (breaks cycles by design
    /// of the image, not of the linker).
    Upward,
    /// Classic lazy loading; treated as regular by this linker.
    Lazy,
}

/// One `LC_LOAD_*_DYLIB` entry.
#[derive(Debug, Clone)]
pub struct DylibDep<'a> {
    pub name: &'a str,
    pub kind: DepKind,
    pub compat_version: u32,
    pub current_version: u32,
}

/// The `LC_ID_DYLIB` self-identification of a dylib.
#[derive(Debug, Clone)]
pub struct DylibId<'a> {
    pub name: &'a str,
    pub compat_version: u32,
    pub current_version: u32,
}

/// Where execution enters a main executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// `LC_MAIN`: file offset of `main` within `__TEXT`.
    Main(u64),
    /// `LC_UNIXTHREAD`: absolute (unslid) pc from the register state.
    Thread,
}

/// A parsed, validated view of one Mach-O image's load commands.
///
/// Borrows the underlying header bytes; nothing is copied out except the
/// typed command structs.
#[derive(Debug)]
pub struct MachFile<'a> {
    pub ctx: Ctx,
    pub header: Header,
    pub segments: Vec<Segment>,
    pub id: Option<DylibId<'a>>,
    pub deps: Vec<DylibDep<'a>>,
    pub rpaths: Vec<&'a str>,
    pub sub_framework_parent: Option<&'a str>,
    pub sub_umbrellas: Vec<&'a str>,
    pub sub_libraries: Vec<&'a str>,
    pub symtab: Option<SymtabCommand>,
    pub dysymtab: Option<DysymtabCommand>,
    pub dyld_info: Option<DyldInfoCommand>,
    pub code_signature: Option<LinkeditDataCommand>,
    pub uuid: Option<[u8; 16]>,
    pub entry: Option<Entry>,
    /// `LC_ROUTINES*` initialization routine, as an unslid address.
    pub routines_init: Option<u64>,
    pub min_os_version: Option<u32>,
}

impl<'a> MachFile<'a> {
    /// Parse the header at the start of `bytes` and every load command,
    /// validating command bounds, segment sanity, and the host
    /// architecture.
    pub fn parse(bytes: &'a [u8], host: CpuId) -> error::Result<MachFile<'a>> {
        let (header, ctx) = Header::parse(bytes, 0)?;
        if !arch_compatible(host, (header.cputype, header.cpusubtype)) {
            return Err(Error::UnsupportedArch {
                path: Default::default(),
                cputype: header.cputype,
            });
        }
        match header.filetype {
            header::MH_EXECUTE | header::MH_DYLIB | header::MH_BUNDLE | header::MH_DYLINKER => {}
            other => {
                return Err(Error::MalformedImage {
                    path: Default::default(),
                    reason: format!("filetype {:#x} is not loadable", other),
                });
            }
        }

        let mut file = MachFile {
            ctx,
            header,
            segments: Vec::new(),
            id: None,
            deps: Vec::new(),
            rpaths: Vec::new(),
            sub_framework_parent: None,
            sub_umbrellas: Vec::new(),
            sub_libraries: Vec::new(),
            symtab: None,
            dysymtab: None,
            dyld_info: None,
            code_signature: None,
            uuid: None,
            entry: None,
            routines_init: None,
            min_os_version: None,
        };

        let iter = LoadCommandIter::new(
            bytes,
            Header::size(ctx),
            header.sizeofcmds,
            header.ncmds,
            ctx.le,
        )?;
        for lc in iter {
            let lc = lc?;
            match &lc.command {
                CommandVariant::Segment32(_) | CommandVariant::Segment64(_) => {
                    let segment = Segment::parse(bytes, lc.offset, &lc.command, ctx.le)?;
                    file.segments.push(segment);
                    if file.segments.len() > MAX_SEGMENTS {
                        return Err(Error::TooManyDependencies {
                            path: Default::default(),
                            what: "segments",
                            count: file.segments.len(),
                        });
                    }
                }
                CommandVariant::IdDylib(cmd) => {
                    let name = lc_str(bytes, lc.offset, cmd.cmdsize, cmd.dylib.name)?;
                    file.id = Some(DylibId {
                        name,
                        compat_version: cmd.dylib.compatibility_version,
                        current_version: cmd.dylib.current_version,
                    });
                }
                CommandVariant::LoadDylib(cmd)
                | CommandVariant::LoadWeakDylib(cmd)
                | CommandVariant::ReexportDylib(cmd)
                | CommandVariant::LoadUpwardDylib(cmd)
                | CommandVariant::LazyLoadDylib(cmd) => {
                    let name = lc_str(bytes, lc.offset, cmd.cmdsize, cmd.dylib.name)?;
                    let kind = match cmd.cmd {
                        load_command::LC_LOAD_WEAK_DYLIB => DepKind::Weak,
                        load_command::LC_REEXPORT_DYLIB => DepKind::Reexport,
                        load_command::LC_LOAD_UPWARD_DYLIB => DepKind::Upward,
                        load_command::LC_LAZY_LOAD_DYLIB => DepKind::Lazy,
                        _ => DepKind::Regular,
                    };
                    file.deps.push(DylibDep {
                        name,
                        kind,
                        compat_version: cmd.dylib.compatibility_version,
                        current_version: cmd.dylib.current_version,
                    });
                    if file.deps.len() > MAX_DEPENDENTS {
                        return Err(Error::TooManyDependencies {
                            path: Default::default(),
                            what: "dependent libraries",
                            count: file.deps.len(),
                        });
                    }
                }
                CommandVariant::Rpath(cmd) => {
                    file.rpaths
                        .push(lc_str(bytes, lc.offset, cmd.cmdsize, cmd.path)?);
                }
                CommandVariant::SubFramework(cmd) => {
                    file.sub_framework_parent =
                        Some(lc_str(bytes, lc.offset, cmd.cmdsize, cmd.umbrella)?);
                }
                CommandVariant::SubUmbrella(cmd) => {
                    file.sub_umbrellas
                        .push(lc_str(bytes, lc.offset, cmd.cmdsize, cmd.sub_umbrella)?);
                }
                CommandVariant::SubLibrary(cmd) => {
                    file.sub_libraries
                        .push(lc_str(bytes, lc.offset, cmd.cmdsize, cmd.sub_library)?);
                }
                CommandVariant::SubClient(_) => {}
                CommandVariant::Symtab(cmd) => file.symtab = Some(*cmd),
                CommandVariant::Dysymtab(cmd) => file.dysymtab = Some(*cmd),
                CommandVariant::DyldInfo(cmd) | CommandVariant::DyldInfoOnly(cmd) => {
                    file.dyld_info = Some(*cmd)
                }
                CommandVariant::CodeSignature(cmd) => {
                    if file.code_signature.is_some() {
                        return Err(Error::MalformedImage {
                            path: Default::default(),
                            reason: "duplicate LC_CODE_SIGNATURE".into(),
                        });
                    }
                    file.code_signature = Some(*cmd);
                }
                CommandVariant::Uuid(cmd) => file.uuid = Some(cmd.uuid),
                CommandVariant::Main(cmd) => file.entry = Some(Entry::Main(cmd.entryoff)),
                CommandVariant::Unixthread(_) => file.entry = Some(Entry::Thread),
                CommandVariant::Thread(_) => {}
                CommandVariant::Routines32(cmd) => {
                    file.routines_init = Some(cmd.init_address as u64)
                }
                CommandVariant::Routines64(cmd) => file.routines_init = Some(cmd.init_address),
                CommandVariant::VersionMin(cmd) => file.min_os_version = Some(cmd.version),
                CommandVariant::LoadDylinker(_)
                | CommandVariant::IdDylinker(_)
                | CommandVariant::DyldEnvironment(_)
                | CommandVariant::SourceVersion(_) => {}
                CommandVariant::Unimplemented(lc) => {
                    if lc.cmd & load_command::LC_REQ_DYLD != 0 {
                        return Err(Error::MalformedImage {
                            path: Default::default(),
                            reason: format!(
                                "unknown load command {:#x} required by dyld",
                                lc.cmd
                            ),
                        });
                    }
                }
            }
        }

        file.validate_segments()?;
        Ok(file)
    }

    /// Reject overlapping or duplicate-named segments.
    fn validate_segments(&self) -> error::Result<()> {
        let mut spans: Vec<(u64, u64, &str)> = self
            .segments
            .iter()
            .filter(|s| s.vmsize > 0)
            .map(|s| (s.vmaddr, s.vmaddr + s.vmsize, s.name()))
            .collect();
        spans.sort_by_key(|&(start, _, _)| start);
        for pair in spans.windows(2) {
            if pair[1].0 < pair[0].1 {
                return Err(Error::MalformedImage {
                    path: Default::default(),
                    reason: format!(
                        "segment {} overlaps segment {}",
                        pair[1].2, pair[0].2
                    ),
                });
            }
        }
        for (i, a) in self.segments.iter().enumerate() {
            if self.segments[i + 1..].iter().any(|b| b.segname == a.segname) {
                return Err(Error::MalformedImage {
                    path: Default::default(),
                    reason: format!("duplicate segment {}", a.name()),
                });
            }
        }
        Ok(())
    }

    /// The LINKEDIT segment, where fix-up streams and symbol tables live.
    pub fn linkedit_segment(&self) -> Option<&Segment> {
        self.segments
            .iter()
            .find(|s| s.name() == constants::SEG_LINKEDIT)
    }

    /// Does the image carry a `__RESTRICT/__restrict` section (which
    /// disables environment controls)?
    pub fn has_restrict_section(&self) -> bool {
        self.segments.iter().any(|seg| {
            seg.name() == constants::SEG_RESTRICT
                && seg
                    .sections
                    .iter()
                    .any(|sect| sect.name() == constants::SECT_RESTRICT)
        })
    }

    /// Uses the compressed LINKEDIT format (opcode streams + export trie)
    /// rather than classic symbol-table binding.
    pub fn is_compressed(&self) -> bool {
        self.dyld_info.is_some()
    }
}

/// Is a file of `file` cpu type/subtype runnable on `host`?
pub fn arch_compatible(host: CpuId, file: CpuId) -> bool {
    cputype::slice_preference(host).iter().any(|&(t, s)| {
        t == file.0
            && (s == cputype::CPU_SUBTYPE_MASK || s == file.1 & cputype::CPU_SUBTYPE_MASK)
    })
}

/// Locate the Mach-O slice for `host` within `bytes`: the whole file for a
/// thin image, or the best fat slice for the host cpu.
pub fn find_host_slice(bytes: &[u8], host: CpuId) -> error::Result<(usize, usize)> {
    if bytes.len() < 4 {
        return Err(Error::MalformedImage {
            path: Default::default(),
            reason: "file shorter than a magic number".into(),
        });
    }
    let magic: u32 = bytes.pread_with(0, scroll::BE)?;
    if fat::is_fat_magic(magic) {
        let fat_header = fat::FatHeader::parse(bytes)?;
        let arches = fat::FatArch::parse_arches(bytes, fat_header.nfat_arch as usize)?;
        let best = fat::best_slice(&arches, host).ok_or(Error::UnsupportedArch {
            path: Default::default(),
            cputype: arches.first().map(|a| a.cputype).unwrap_or(0),
        })?;
        let (start, end) = best.slice_range(bytes.len() as u64)?;
        Ok((start as usize, (end - start) as usize))
    } else {
        Ok((0, bytes.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mach::cputype::*;

    #[test]
    fn arch_compat_table() {
        let host = (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E);
        assert!(arch_compatible(host, (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E)));
        assert!(arch_compatible(host, (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL)));
        assert!(!arch_compatible(host, (CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_ALL)));

        let plain = (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL);
        assert!(!arch_compatible(plain, (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E)));
    }
}

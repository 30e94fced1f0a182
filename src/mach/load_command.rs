//! Load commands tell the kernel and the dynamic linker how to map a binary
//! into memory, which libraries it needs, where its fix-up information
//! lives, and where control enters it.

use scroll::{Endian, Pread, Pwrite, SizeWith, ctx};

use crate::error;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
/// Occurs at the beginning of every load command, serving as the tagged
/// union discriminant.
pub struct LoadCommandHeader {
    pub cmd: u32,
    pub cmdsize: u32,
}

pub const SIZEOF_LOAD_COMMAND: usize = 8;

/// Offset of a string from the start of its load command.
pub type LcStr = u32;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct SegmentCommand32 {
    pub cmd: u32,
    pub cmdsize: u32,
    pub segname: [u8; 16],
    pub vmaddr: u32,
    pub vmsize: u32,
    pub fileoff: u32,
    pub filesize: u32,
    pub maxprot: u32,
    pub initprot: u32,
    pub nsects: u32,
    pub flags: u32,
}

pub const SIZEOF_SEGMENT_COMMAND_32: usize = 56;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct SegmentCommand64 {
    pub cmd: u32,
    pub cmdsize: u32,
    pub segname: [u8; 16],
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: u32,
    pub initprot: u32,
    pub nsects: u32,
    pub flags: u32,
}

pub const SIZEOF_SEGMENT_COMMAND_64: usize = 72;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct Section32 {
    /// name of this section
    pub sectname: [u8; 16],
    /// segment this section goes in
    pub segname: [u8; 16],
    pub addr: u32,
    pub size: u32,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
}

pub const SIZEOF_SECTION_32: usize = 68;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct Section64 {
    pub sectname: [u8; 16],
    pub segname: [u8; 16],
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    pub reserved3: u32,
}

pub const SIZEOF_SECTION_64: usize = 80;

/// Dynamically linked shared libraries are identified by the pathname the
/// library is found at for execution plus a compatibility version: the
/// client's required compatibility number must be less than or equal to
/// the library's.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct Dylib {
    /// library's path name, offset from the command start
    pub name: LcStr,
    /// library's build time stamp
    pub timestamp: u32,
    /// library's current version number
    pub current_version: u32,
    /// library's compatibility version number
    pub compatibility_version: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct DylibCommand {
    /// LC_ID_DYLIB, LC_LOAD_DYLIB, LC_LOAD_WEAK_DYLIB, LC_REEXPORT_DYLIB,
    /// LC_LOAD_UPWARD_DYLIB or LC_LAZY_LOAD_DYLIB
    pub cmd: u32,
    /// includes pathname string
    pub cmdsize: u32,
    pub dylib: Dylib,
}

pub const SIZEOF_DYLIB_COMMAND: usize = 24;

/// The umbrella framework a sub-framework belongs to; only the umbrella
/// (or its other sub-frameworks) may link against it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct SubFrameworkCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    /// the umbrella framework name
    pub umbrella: LcStr,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct SubClientCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    /// a client allowed to link against this sub-framework
    pub client: LcStr,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct SubUmbrellaCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub sub_umbrella: LcStr,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct SubLibraryCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub sub_library: LcStr,
}

/// The name of the dynamic linker (LC_LOAD_DYLINKER / LC_ID_DYLINKER), or
/// an environment addition (LC_DYLD_ENVIRONMENT).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct DylinkerCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub name: LcStr,
}

/// The address of a shared library initialization routine, called before
/// any section-based initializers in the image.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct RoutinesCommand32 {
    pub cmd: u32,
    pub cmdsize: u32,
    pub init_address: u32,
    pub init_module: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    pub reserved3: u32,
    pub reserved4: u32,
    pub reserved5: u32,
    pub reserved6: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct RoutinesCommand64 {
    pub cmd: u32,
    pub cmdsize: u32,
    pub init_address: u64,
    pub init_module: u64,
    pub reserved1: u64,
    pub reserved2: u64,
    pub reserved3: u64,
    pub reserved4: u64,
    pub reserved5: u64,
    pub reserved6: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct SymtabCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
}

pub const SIZEOF_SYMTAB_COMMAND: usize = 24;

/// The second set of symbolic information, grouping the symbol table into
/// local, externally defined, and undefined ranges, plus the indirect
/// symbol table used by classic lazy binding.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct DysymtabCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub ilocalsym: u32,
    pub nlocalsym: u32,
    pub iextdefsym: u32,
    pub nextdefsym: u32,
    pub iundefsym: u32,
    pub nundefsym: u32,
    pub tocoff: u32,
    pub ntoc: u32,
    pub modtaboff: u32,
    pub nmodtab: u32,
    pub extrefsymoff: u32,
    pub nextrefsyms: u32,
    pub indirectsymoff: u32,
    pub nindirectsyms: u32,
    pub extreloff: u32,
    pub nextrel: u32,
    pub locreloff: u32,
    pub nlocrel: u32,
}

pub const SIZEOF_DYSYMTAB_COMMAND: usize = 80;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct UuidCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    /// the 128-bit uuid
    pub uuid: [u8; 16],
}

pub const SIZEOF_UUID_COMMAND: usize = 24;

/// A directory to add to the run path used when resolving `@rpath/…`
/// loads.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct RpathCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub path: LcStr,
}

/// The offset and size of a blob of data in the LINKEDIT segment
/// (code signature, function starts, data-in-code, …).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct LinkeditDataCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub dataoff: u32,
    pub datasize: u32,
}

pub const SIZEOF_LINKEDIT_DATA_COMMAND: usize = 16;

/// The minimum OS version this binary was built to run on,
/// X.Y.Z encoded in nibbles as xxxx.yy.zz.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct VersionMinCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub version: u32,
    pub sdk: u32,
}

/// File offsets and sizes of the compressed LINKEDIT information: the
/// rebase, bind, weak-bind, and lazy-bind opcode streams plus the export
/// trie.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct DyldInfoCommand {
    /// LC_DYLD_INFO or LC_DYLD_INFO_ONLY
    pub cmd: u32,
    pub cmdsize: u32,
    pub rebase_off: u32,
    pub rebase_size: u32,
    pub bind_off: u32,
    pub bind_size: u32,
    pub weak_bind_off: u32,
    pub weak_bind_size: u32,
    pub lazy_bind_off: u32,
    pub lazy_bind_size: u32,
    pub export_off: u32,
    pub export_size: u32,
}

pub const SIZEOF_DYLD_INFO_COMMAND: usize = 48;

/// Replacement for LC_UNIXTHREAD in newer main executables: the file
/// offset of `main()` within `__TEXT`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct EntryPointCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub entryoff: u64,
    pub stacksize: u64,
}

pub const SIZEOF_ENTRY_POINT_COMMAND: usize = 24;

/// Machine-specific register state; for LC_UNIXTHREAD mains, the program
/// counter in the state is the entry point. Only the fixed prefix is
/// typed; the flavored payload is consumed by the boot code.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct ThreadCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub flavor: u32,
    pub count: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct SourceVersionCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    /// A.B.C.D.E packed as a24.b10.c10.d10.e10
    pub version: u64,
}

///////////////////////////////////////
// Constants
///////////////////////////////////////

/// Commands the dynamic linker must understand to run the binary; an
/// unknown command carrying this bit is a hard load failure.
pub const LC_REQ_DYLD: u32 = 0x8000_0000;

pub const LC_SEGMENT: u32 = 0x1;
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_THREAD: u32 = 0x4;
pub const LC_UNIXTHREAD: u32 = 0x5;
pub const LC_DYSYMTAB: u32 = 0xb;
pub const LC_LOAD_DYLIB: u32 = 0xc;
pub const LC_ID_DYLIB: u32 = 0xd;
pub const LC_LOAD_DYLINKER: u32 = 0xe;
pub const LC_ID_DYLINKER: u32 = 0xf;
pub const LC_ROUTINES: u32 = 0x11;
pub const LC_SUB_FRAMEWORK: u32 = 0x12;
pub const LC_SUB_UMBRELLA: u32 = 0x13;
pub const LC_SUB_CLIENT: u32 = 0x14;
pub const LC_SUB_LIBRARY: u32 = 0x15;
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_ROUTINES_64: u32 = 0x1a;
pub const LC_UUID: u32 = 0x1b;
pub const LC_RPATH: u32 = 0x1c | LC_REQ_DYLD;
pub const LC_CODE_SIGNATURE: u32 = 0x1d;
pub const LC_SEGMENT_SPLIT_INFO: u32 = 0x1e;
pub const LC_REEXPORT_DYLIB: u32 = 0x1f | LC_REQ_DYLD;
pub const LC_LAZY_LOAD_DYLIB: u32 = 0x20;
pub const LC_DYLD_INFO: u32 = 0x22;
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
pub const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;
pub const LC_VERSION_MIN_MACOSX: u32 = 0x24;
pub const LC_VERSION_MIN_IPHONEOS: u32 = 0x25;
pub const LC_FUNCTION_STARTS: u32 = 0x26;
pub const LC_DYLD_ENVIRONMENT: u32 = 0x27;
pub const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;
pub const LC_DATA_IN_CODE: u32 = 0x29;
pub const LC_SOURCE_VERSION: u32 = 0x2A;

pub fn cmd_to_str(cmd: u32) -> &'static str {
    match cmd {
        LC_SEGMENT => "LC_SEGMENT",
        LC_SYMTAB => "LC_SYMTAB",
        LC_THREAD => "LC_THREAD",
        LC_UNIXTHREAD => "LC_UNIXTHREAD",
        LC_DYSYMTAB => "LC_DYSYMTAB",
        LC_LOAD_DYLIB => "LC_LOAD_DYLIB",
        LC_ID_DYLIB => "LC_ID_DYLIB",
        LC_LOAD_DYLINKER => "LC_LOAD_DYLINKER",
        LC_ID_DYLINKER => "LC_ID_DYLINKER",
        LC_ROUTINES => "LC_ROUTINES",
        LC_SUB_FRAMEWORK => "LC_SUB_FRAMEWORK",
        LC_SUB_UMBRELLA => "LC_SUB_UMBRELLA",
        LC_SUB_CLIENT => "LC_SUB_CLIENT",
        LC_SUB_LIBRARY => "LC_SUB_LIBRARY",
        LC_LOAD_WEAK_DYLIB => "LC_LOAD_WEAK_DYLIB",
        LC_SEGMENT_64 => "LC_SEGMENT_64",
        LC_ROUTINES_64 => "LC_ROUTINES_64",
        LC_UUID => "LC_UUID",
        LC_RPATH => "LC_RPATH",
        LC_CODE_SIGNATURE => "LC_CODE_SIGNATURE",
        LC_SEGMENT_SPLIT_INFO => "LC_SEGMENT_SPLIT_INFO",
        LC_REEXPORT_DYLIB => "LC_REEXPORT_DYLIB",
        LC_LAZY_LOAD_DYLIB => "LC_LAZY_LOAD_DYLIB",
        LC_DYLD_INFO => "LC_DYLD_INFO",
        LC_DYLD_INFO_ONLY => "LC_DYLD_INFO_ONLY",
        LC_LOAD_UPWARD_DYLIB => "LC_LOAD_UPWARD_DYLIB",
        LC_VERSION_MIN_MACOSX => "LC_VERSION_MIN_MACOSX",
        LC_VERSION_MIN_IPHONEOS => "LC_VERSION_MIN_IPHONEOS",
        LC_FUNCTION_STARTS => "LC_FUNCTION_STARTS",
        LC_DYLD_ENVIRONMENT => "LC_DYLD_ENVIRONMENT",
        LC_MAIN => "LC_MAIN",
        LC_DATA_IN_CODE => "LC_DATA_IN_CODE",
        LC_SOURCE_VERSION => "LC_SOURCE_VERSION",
        _ => "LC_UNKNOWN",
    }
}

///////////////////////////////////////////
// Typesafe command variants
///////////////////////////////////////////

#[derive(Debug)]
pub enum CommandVariant {
    Segment32(SegmentCommand32),
    Segment64(SegmentCommand64),
    Symtab(SymtabCommand),
    Dysymtab(DysymtabCommand),
    Thread(ThreadCommand),
    Unixthread(ThreadCommand),
    IdDylib(DylibCommand),
    LoadDylib(DylibCommand),
    LoadWeakDylib(DylibCommand),
    ReexportDylib(DylibCommand),
    LoadUpwardDylib(DylibCommand),
    LazyLoadDylib(DylibCommand),
    LoadDylinker(DylinkerCommand),
    IdDylinker(DylinkerCommand),
    DyldEnvironment(DylinkerCommand),
    Routines32(RoutinesCommand32),
    Routines64(RoutinesCommand64),
    SubFramework(SubFrameworkCommand),
    SubUmbrella(SubUmbrellaCommand),
    SubClient(SubClientCommand),
    SubLibrary(SubLibraryCommand),
    Uuid(UuidCommand),
    Rpath(RpathCommand),
    CodeSignature(LinkeditDataCommand),
    DyldInfo(DyldInfoCommand),
    DyldInfoOnly(DyldInfoCommand),
    VersionMin(VersionMinCommand),
    Main(EntryPointCommand),
    SourceVersion(SourceVersionCommand),
    Unimplemented(LoadCommandHeader),
}

impl<'a> ctx::TryFromCtx<'a, Endian> for CommandVariant {
    type Error = error::Error;
    fn try_from_ctx(bytes: &'a [u8], le: Endian) -> Result<(Self, usize), Self::Error> {
        use self::CommandVariant::*;
        let lc = bytes.pread_with::<LoadCommandHeader>(0, le)?;
        let size = lc.cmdsize as usize;
        if size < SIZEOF_LOAD_COMMAND || size > bytes.len() {
            return Err(error::Error::MalformedImage {
                path: Default::default(),
                reason: format!(
                    "{} has size {} larger than remaining commands ({})",
                    cmd_to_str(lc.cmd),
                    size,
                    bytes.len()
                ),
            });
        }
        let variant = match lc.cmd {
            LC_SEGMENT => Segment32(bytes.pread_with(0, le)?),
            LC_SEGMENT_64 => Segment64(bytes.pread_with(0, le)?),
            LC_SYMTAB => Symtab(bytes.pread_with(0, le)?),
            LC_DYSYMTAB => Dysymtab(bytes.pread_with(0, le)?),
            LC_THREAD => Thread(bytes.pread_with(0, le)?),
            LC_UNIXTHREAD => Unixthread(bytes.pread_with(0, le)?),
            LC_ID_DYLIB => IdDylib(bytes.pread_with(0, le)?),
            LC_LOAD_DYLIB => LoadDylib(bytes.pread_with(0, le)?),
            LC_LOAD_WEAK_DYLIB => LoadWeakDylib(bytes.pread_with(0, le)?),
            LC_REEXPORT_DYLIB => ReexportDylib(bytes.pread_with(0, le)?),
            LC_LOAD_UPWARD_DYLIB => LoadUpwardDylib(bytes.pread_with(0, le)?),
            LC_LAZY_LOAD_DYLIB => LazyLoadDylib(bytes.pread_with(0, le)?),
            LC_LOAD_DYLINKER => LoadDylinker(bytes.pread_with(0, le)?),
            LC_ID_DYLINKER => IdDylinker(bytes.pread_with(0, le)?),
            LC_DYLD_ENVIRONMENT => DyldEnvironment(bytes.pread_with(0, le)?),
            LC_ROUTINES => Routines32(bytes.pread_with(0, le)?),
            LC_ROUTINES_64 => Routines64(bytes.pread_with(0, le)?),
            LC_SUB_FRAMEWORK => SubFramework(bytes.pread_with(0, le)?),
            LC_SUB_UMBRELLA => SubUmbrella(bytes.pread_with(0, le)?),
            LC_SUB_CLIENT => SubClient(bytes.pread_with(0, le)?),
            LC_SUB_LIBRARY => SubLibrary(bytes.pread_with(0, le)?),
            LC_UUID => Uuid(bytes.pread_with(0, le)?),
            LC_RPATH => Rpath(bytes.pread_with(0, le)?),
            LC_CODE_SIGNATURE => CodeSignature(bytes.pread_with(0, le)?),
            LC_DYLD_INFO => DyldInfo(bytes.pread_with(0, le)?),
            LC_DYLD_INFO_ONLY => DyldInfoOnly(bytes.pread_with(0, le)?),
            LC_VERSION_MIN_MACOSX | LC_VERSION_MIN_IPHONEOS => {
                VersionMin(bytes.pread_with(0, le)?)
            }
            LC_MAIN => Main(bytes.pread_with(0, le)?),
            LC_SOURCE_VERSION => SourceVersion(bytes.pread_with(0, le)?),
            _ => Unimplemented(lc),
        };
        Ok((variant, size))
    }
}

impl CommandVariant {
    pub fn cmd(&self) -> u32 {
        use self::CommandVariant::*;
        match self {
            Segment32(c) => c.cmd,
            Segment64(c) => c.cmd,
            Symtab(c) => c.cmd,
            Dysymtab(c) => c.cmd,
            Thread(c) | Unixthread(c) => c.cmd,
            IdDylib(c) | LoadDylib(c) | LoadWeakDylib(c) | ReexportDylib(c)
            | LoadUpwardDylib(c) | LazyLoadDylib(c) => c.cmd,
            LoadDylinker(c) | IdDylinker(c) | DyldEnvironment(c) => c.cmd,
            Routines32(c) => c.cmd,
            Routines64(c) => c.cmd,
            SubFramework(c) => c.cmd,
            SubUmbrella(c) => c.cmd,
            SubClient(c) => c.cmd,
            SubLibrary(c) => c.cmd,
            Uuid(c) => c.cmd,
            Rpath(c) => c.cmd,
            CodeSignature(c) => c.cmd,
            DyldInfo(c) | DyldInfoOnly(c) => c.cmd,
            VersionMin(c) => c.cmd,
            Main(c) => c.cmd,
            SourceVersion(c) => c.cmd,
            Unimplemented(c) => c.cmd,
        }
    }
}

/// A parsed load command and its offset within the image's header bytes.
#[derive(Debug)]
pub struct LoadCommand {
    pub offset: usize,
    pub command: CommandVariant,
}

/// Walks the load-command table, validating that each command's declared
/// size is at least the fixed header and that every command lies inside
/// `sizeofcmds`.
pub struct LoadCommandIter<'a> {
    bytes: &'a [u8],
    offset: usize,
    end: usize,
    remaining: usize,
    le: Endian,
}

impl<'a> LoadCommandIter<'a> {
    /// `bytes` is the whole header region; commands begin at `start` and
    /// occupy `sizeofcmds` bytes, `ncmds` of them.
    pub fn new(
        bytes: &'a [u8],
        start: usize,
        sizeofcmds: u32,
        ncmds: usize,
        le: Endian,
    ) -> error::Result<Self> {
        let end = start
            .checked_add(sizeofcmds as usize)
            .filter(|&e| e <= bytes.len())
            .ok_or_else(|| error::Error::MalformedImage {
                path: Default::default(),
                reason: format!(
                    "load commands (sizeofcmds {:#x}) overrun the mapped header",
                    sizeofcmds
                ),
            })?;
        Ok(LoadCommandIter {
            bytes,
            offset: start,
            end,
            remaining: ncmds,
            le,
        })
    }
}

impl<'a> Iterator for LoadCommandIter<'a> {
    type Item = error::Result<LoadCommand>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let start = self.offset;
        if start + SIZEOF_LOAD_COMMAND > self.end {
            return Some(Err(error::Error::MalformedImage {
                path: Default::default(),
                reason: format!("load command at {:#x} overruns sizeofcmds", start),
            }));
        }
        let window = &self.bytes[start..self.end];
        match window.pread_with::<CommandVariant>(0, self.le) {
            Ok(command) => {
                let lc = match window.pread_with::<LoadCommandHeader>(0, self.le) {
                    Ok(lc) => lc,
                    Err(e) => return Some(Err(e.into())),
                };
                self.offset = start + lc.cmdsize as usize;
                Some(Ok(LoadCommand {
                    offset: start,
                    command,
                }))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// Reads the name string a load command refers to, bounds-checked against
/// the command's own extent.
pub fn lc_str<'a>(
    bytes: &'a [u8],
    cmd_offset: usize,
    cmdsize: u32,
    name: LcStr,
) -> error::Result<&'a str> {
    let start = cmd_offset + name as usize;
    let end = cmd_offset + cmdsize as usize;
    if name as usize >= cmdsize as usize || end > bytes.len() {
        return Err(error::Error::MalformedImage {
            path: Default::default(),
            reason: format!("lc_str offset {:#x} outside its load command", name),
        });
    }
    let s = bytes[..end].pread_with::<&str>(start, ctx::StrCtx::Delimiter(0))?;
    Ok(s)
}

/// Generalized 32/64-bit segment with its sections.
#[derive(Debug, Clone)]
pub struct Segment {
    pub segname: [u8; 16],
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: u32,
    pub initprot: u32,
    pub flags: u32,
    pub sections: Vec<Section>,
}

/// Generalized 32/64-bit section.
#[derive(Debug, Clone)]
pub struct Section {
    pub sectname: [u8; 16],
    pub segname: [u8; 16],
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub align: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
}

fn fixed_name(name: &[u8; 16]) -> &str {
    let len = name.iter().position(|&b| b == 0).unwrap_or(16);
    std::str::from_utf8(&name[..len]).unwrap_or("")
}

impl Segment {
    pub fn name(&self) -> &str {
        fixed_name(&self.segname)
    }

    /// Parse a segment command plus its trailing section headers.
    pub fn parse(
        bytes: &[u8],
        cmd_offset: usize,
        command: &CommandVariant,
        le: Endian,
    ) -> error::Result<Segment> {
        match command {
            CommandVariant::Segment32(seg) => {
                let mut sections = Vec::with_capacity(seg.nsects as usize);
                let mut offset = cmd_offset + SIZEOF_SEGMENT_COMMAND_32;
                let end = cmd_offset + seg.cmdsize as usize;
                for _ in 0..seg.nsects {
                    if offset + SIZEOF_SECTION_32 > end {
                        return Err(error::Error::MalformedImage {
                            path: Default::default(),
                            reason: format!("sections overrun segment command {}", seg.cmdsize),
                        });
                    }
                    let sect = bytes.pread_with::<Section32>(offset, le)?;
                    sections.push(Section::from(sect));
                    offset += SIZEOF_SECTION_32;
                }
                Ok(Segment {
                    segname: seg.segname,
                    vmaddr: seg.vmaddr as u64,
                    vmsize: seg.vmsize as u64,
                    fileoff: seg.fileoff as u64,
                    filesize: seg.filesize as u64,
                    maxprot: seg.maxprot,
                    initprot: seg.initprot,
                    flags: seg.flags,
                    sections,
                })
            }
            CommandVariant::Segment64(seg) => {
                let mut sections = Vec::with_capacity(seg.nsects as usize);
                let mut offset = cmd_offset + SIZEOF_SEGMENT_COMMAND_64;
                let end = cmd_offset + seg.cmdsize as usize;
                for _ in 0..seg.nsects {
                    if offset + SIZEOF_SECTION_64 > end {
                        return Err(error::Error::MalformedImage {
                            path: Default::default(),
                            reason: format!("sections overrun segment command {}", seg.cmdsize),
                        });
                    }
                    let sect = bytes.pread_with::<Section64>(offset, le)?;
                    sections.push(Section::from(sect));
                    offset += SIZEOF_SECTION_64;
                }
                Ok(Segment {
                    segname: seg.segname,
                    vmaddr: seg.vmaddr,
                    vmsize: seg.vmsize,
                    fileoff: seg.fileoff,
                    filesize: seg.filesize,
                    maxprot: seg.maxprot,
                    initprot: seg.initprot,
                    flags: seg.flags,
                    sections,
                })
            }
            _ => Err(error::Error::MalformedImage {
                path: Default::default(),
                reason: "not a segment command".into(),
            }),
        }
    }
}

impl Section {
    pub fn name(&self) -> &str {
        fixed_name(&self.sectname)
    }

    pub fn segment_name(&self) -> &str {
        fixed_name(&self.segname)
    }

    /// Section type (low byte of flags).
    #[inline]
    pub fn section_type(&self) -> u32 {
        self.flags & super::constants::SECTION_TYPE
    }
}

impl From<Section32> for Section {
    fn from(s: Section32) -> Self {
        Section {
            sectname: s.sectname,
            segname: s.segname,
            addr: s.addr as u64,
            size: s.size as u64,
            offset: s.offset,
            align: s.align,
            flags: s.flags,
            reserved1: s.reserved1,
            reserved2: s.reserved2,
        }
    }
}

impl From<Section64> for Section {
    fn from(s: Section64) -> Self {
        Section {
            sectname: s.sectname,
            segname: s.segname,
            addr: s.addr,
            size: s.size,
            offset: s.offset,
            align: s.align,
            flags: s.flags,
            reserved1: s.reserved1,
            reserved2: s.reserved2,
        }
    }
}

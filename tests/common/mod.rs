//! Shared test support: a programmatic Mach-O builder producing small,
//! loadable 64-bit images, plus linker construction helpers.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use scroll::{LE, Pwrite};

use machload::context::{LinkContext, Linker};
use machload::image::{Image, ImageFlags, ImageId, LoadOptions};
use machload::linkedit::bind::{self, BindSite, Ordinal};
use machload::linkedit::exports::{BuiltExport, EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION, TrieBuilder};
use machload::linkedit::rebase;
use machload::mach::constants::cputype::{CPU_SUBTYPE_X86_64_ALL, CPU_TYPE_X86_64, CpuId};
use machload::mach::constants::{
    S_INTERPOSING, S_MOD_INIT_FUNC_POINTERS, S_MOD_TERM_FUNC_POINTERS, VM_PROT_READ,
    VM_PROT_WRITE,
};
use machload::mach::header::{
    MH_BINDS_TO_WEAK, MH_DYLDLINK, MH_DYLIB, MH_EXECUTE, MH_MAGIC_64, MH_PIE, MH_TWOLEVEL,
    MH_WEAK_DEFINES, Header64, SIZEOF_HEADER_64,
};
use machload::mach::load_command::*;

pub const HOST: CpuId = (CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_ALL);

/// Segment granule: 16K keeps file offsets mappable on both 4K and 16K
/// page hosts.
pub const PAGE: u64 = 0x4000;

/// Fixed offsets inside the __DATA segment.
pub const INTERPOSE_OFF: u64 = 0x400;
pub const INIT_OFF: u64 = 0x600;
pub const TERM_OFF: u64 = 0x680;

#[derive(Clone)]
pub struct DepSpec {
    pub name: String,
    pub cmd: u32,
    pub compat: u32,
    pub current: u32,
}

impl DepSpec {
    pub fn regular(name: &str) -> DepSpec {
        DepSpec {
            name: name.into(),
            cmd: LC_LOAD_DYLIB,
            compat: 0x10000,
            current: 0x10000,
        }
    }

    pub fn weak(name: &str) -> DepSpec {
        DepSpec {
            cmd: LC_LOAD_WEAK_DYLIB,
            ..DepSpec::regular(name)
        }
    }
}

#[derive(Clone)]
pub struct ExportSpec {
    pub name: String,
    /// Offset from the image's preferred base.
    pub image_offset: u64,
    pub weak: bool,
}

#[derive(Clone)]
pub struct BindSpec {
    /// Offset of the pointer slot within __DATA.
    pub data_offset: u64,
    pub ordinal: Ordinal,
    pub symbol: String,
    pub weak_import: bool,
}

/// Builds one synthetic Mach-O image: `__TEXT` (header only), `__DATA`
/// (pointer slots and the special sections), `__LINKEDIT` (the opcode
/// streams and export trie).
pub struct ImageBuilder {
    pub filetype: u32,
    pub preferred_base: u64,
    pub install_name: Option<String>,
    pub deps: Vec<DepSpec>,
    pub rpaths: Vec<String>,
    pub exports: Vec<ExportSpec>,
    /// Extra rebase sites within __DATA (slot holds an unslid address).
    pub rebases: Vec<u64>,
    /// Initial `__DATA` contents.
    pub data_words: Vec<(u64, u64)>,
    pub binds: Vec<BindSpec>,
    pub lazy_binds: Vec<BindSpec>,
    pub weak_strong_defs: Vec<String>,
    /// `(data offset, symbol)` weak-reference sites.
    pub weak_refs: Vec<(u64, String)>,
    /// Unslid initializer entry addresses, in declaration order.
    pub init_funcs: Vec<u64>,
    pub term_funcs: Vec<u64>,
    /// `(replacement unslid address, bind ordinal, replacee symbol)`.
    pub interpose: Vec<(u64, Ordinal, String)>,
    pub entry_offset: Option<u64>,
    pub extra_flags: u32,
    /// Give __DATA a zero-fill tail page.
    pub zerofill_tail: bool,
}

impl ImageBuilder {
    pub fn dylib(install_name: &str) -> ImageBuilder {
        ImageBuilder {
            filetype: MH_DYLIB,
            preferred_base: 0,
            install_name: Some(install_name.into()),
            deps: Vec::new(),
            rpaths: Vec::new(),
            exports: Vec::new(),
            rebases: Vec::new(),
            data_words: Vec::new(),
            binds: Vec::new(),
            lazy_binds: Vec::new(),
            weak_strong_defs: Vec::new(),
            weak_refs: Vec::new(),
            init_funcs: Vec::new(),
            term_funcs: Vec::new(),
            interpose: Vec::new(),
            entry_offset: None,
            extra_flags: 0,
            zerofill_tail: true,
        }
    }

    pub fn executable(preferred_base: u64) -> ImageBuilder {
        ImageBuilder {
            filetype: MH_EXECUTE,
            preferred_base,
            install_name: None,
            entry_offset: Some(0x120),
            ..ImageBuilder::dylib("")
        }
    }

    /// Export `name` at `data_offset` within __DATA.
    pub fn export_data(mut self, name: &str, data_offset: u64, weak: bool) -> Self {
        self.exports.push(ExportSpec {
            name: name.into(),
            image_offset: self.data_vmoff() + data_offset,
            weak,
        });
        self
    }

    /// Export `name` at an offset inside __TEXT.
    pub fn export_text(mut self, name: &str, text_offset: u64, weak: bool) -> Self {
        self.exports.push(ExportSpec {
            name: name.into(),
            image_offset: text_offset,
            weak,
        });
        self
    }

    pub fn dep(mut self, spec: DepSpec) -> Self {
        self.deps.push(spec);
        self
    }

    pub fn bind(mut self, data_offset: u64, ordinal: Ordinal, symbol: &str) -> Self {
        self.binds.push(BindSpec {
            data_offset,
            ordinal,
            symbol: symbol.into(),
            weak_import: false,
        });
        self
    }

    fn data_vmoff(&self) -> u64 {
        PAGE
    }

    fn linkedit_vmoff(&self) -> u64 {
        if self.zerofill_tail { PAGE * 3 } else { PAGE * 2 }
    }

    pub fn build(&self) -> Vec<u8> {
        let base = self.preferred_base;
        let data_vm = base + self.data_vmoff();
        let mut file = vec![0u8; (PAGE * 3) as usize];

        ////////////////////////////////////
        // __DATA contents
        ////////////////////////////////////
        let data_file = PAGE as usize;
        let mut rebase_sites: Vec<(u8, u64)> = Vec::new();
        let mut words: Vec<(u64, u64)> = self.data_words.clone();
        for &offset in &self.rebases {
            rebase_sites.push((1, offset));
        }
        for (i, &init) in self.init_funcs.iter().enumerate() {
            let offset = INIT_OFF + i as u64 * 8;
            words.push((offset, init));
            rebase_sites.push((1, offset));
        }
        for (i, &term) in self.term_funcs.iter().enumerate() {
            let offset = TERM_OFF + i as u64 * 8;
            words.push((offset, term));
            rebase_sites.push((1, offset));
        }
        let mut binds = self.binds.clone();
        for (i, (replacement, ordinal, symbol)) in self.interpose.iter().enumerate() {
            let pair_off = INTERPOSE_OFF + i as u64 * 16;
            words.push((pair_off, *replacement));
            rebase_sites.push((1, pair_off));
            binds.push(BindSpec {
                data_offset: pair_off + 8,
                ordinal: *ordinal,
                symbol: symbol.clone(),
                weak_import: false,
            });
        }
        for (offset, value) in &words {
            file[data_file + *offset as usize..data_file + *offset as usize + 8]
                .copy_from_slice(&value.to_le_bytes());
        }
        rebase_sites.sort();
        rebase_sites.dedup();

        ////////////////////////////////////
        // __LINKEDIT streams
        ////////////////////////////////////
        let rebase_stream = rebase::emit_for_sites(&rebase_sites, 8);
        let bind_sites: Vec<BindSite<'_>> = binds
            .iter()
            .map(|b| BindSite {
                segment: 1,
                offset: b.data_offset,
                ordinal: b.ordinal,
                symbol: &b.symbol,
                addend: 0,
                weak_import: b.weak_import,
            })
            .collect();
        let bind_stream = bind::emit_for_sites(&bind_sites);
        let lazy_sites: Vec<BindSite<'_>> = self
            .lazy_binds
            .iter()
            .map(|b| BindSite {
                segment: 1,
                offset: b.data_offset,
                ordinal: b.ordinal,
                symbol: &b.symbol,
                addend: 0,
                weak_import: b.weak_import,
            })
            .collect();
        let (lazy_stream, _lazy_offsets) = bind::emit_lazy(&lazy_sites);
        let strong: Vec<&str> = self.weak_strong_defs.iter().map(|s| s.as_str()).collect();
        let weak_sites: Vec<BindSite<'_>> = self
            .weak_refs
            .iter()
            .map(|(offset, symbol)| BindSite {
                segment: 1,
                offset: *offset,
                ordinal: Ordinal::SelfImage,
                symbol,
                addend: 0,
                weak_import: false,
            })
            .collect();
        let weak_stream = if strong.is_empty() && weak_sites.is_empty() {
            Vec::new()
        } else {
            bind::emit_weak(&strong, &weak_sites)
        };
        let mut trie = TrieBuilder::new();
        for export in &self.exports {
            trie.add(
                &export.name,
                BuiltExport::Regular {
                    offset: export.image_offset,
                    flags: if export.weak {
                        EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION
                    } else {
                        0
                    },
                },
            );
        }
        let export_trie = if self.exports.is_empty() {
            Vec::new()
        } else {
            trie.encode()
        };

        let linkedit_file = (PAGE * 2) as usize;
        let mut le_cursor = 0usize;
        let mut place = |bytes: &[u8], file: &mut Vec<u8>| -> (u32, u32) {
            let start = le_cursor;
            file[linkedit_file + start..linkedit_file + start + bytes.len()]
                .copy_from_slice(bytes);
            // Streams stay 8-aligned for the next placement.
            le_cursor = (start + bytes.len() + 7) & !7;
            (
                if bytes.is_empty() { 0 } else { (PAGE * 2) as u32 + start as u32 },
                bytes.len() as u32,
            )
        };
        let (rebase_off, rebase_size) = place(&rebase_stream, &mut file);
        let (bind_off, bind_size) = place(&bind_stream, &mut file);
        let (weak_off, weak_size) = place(&weak_stream, &mut file);
        let (lazy_off, lazy_size) = place(&lazy_stream, &mut file);
        let (export_off, export_size) = place(&export_trie, &mut file);

        ////////////////////////////////////
        // Load commands
        ////////////////////////////////////
        let mut cmds: Vec<u8> = Vec::new();

        // __TEXT
        push_segment(
            &mut cmds,
            "__TEXT",
            base,
            PAGE,
            0,
            PAGE,
            VM_PROT_READ,
            &[],
        );
        // __DATA with its pointer sections.
        let interpose_size = self.interpose.len() as u64 * 16;
        let init_size = self.init_funcs.len() as u64 * 8;
        let term_size = self.term_funcs.len() as u64 * 8;
        let sections: Vec<Section64> = vec![
            section64("__data", "__DATA", data_vm, INTERPOSE_OFF, PAGE, 0),
            section64(
                "__interpose",
                "__DATA",
                data_vm + INTERPOSE_OFF,
                interpose_size,
                PAGE + INTERPOSE_OFF,
                S_INTERPOSING,
            ),
            section64(
                "__mod_init_func",
                "__DATA",
                data_vm + INIT_OFF,
                init_size,
                PAGE + INIT_OFF,
                S_MOD_INIT_FUNC_POINTERS,
            ),
            section64(
                "__mod_term_func",
                "__DATA",
                data_vm + TERM_OFF,
                term_size,
                PAGE + TERM_OFF,
                S_MOD_TERM_FUNC_POINTERS,
            ),
        ];
        let data_vmsize = if self.zerofill_tail { PAGE * 2 } else { PAGE };
        push_segment(
            &mut cmds,
            "__DATA",
            data_vm,
            data_vmsize,
            PAGE,
            PAGE,
            VM_PROT_READ | VM_PROT_WRITE,
            &sections,
        );
        // __LINKEDIT
        push_segment(
            &mut cmds,
            "__LINKEDIT",
            base + self.linkedit_vmoff(),
            PAGE,
            PAGE * 2,
            PAGE,
            VM_PROT_READ,
            &[],
        );

        if let Some(name) = &self.install_name {
            push_dylib_cmd(&mut cmds, LC_ID_DYLIB, name, 0x10000, 0x10000);
        }
        for dep in &self.deps {
            push_dylib_cmd(&mut cmds, dep.cmd, &dep.name, dep.compat, dep.current);
        }
        for rpath in &self.rpaths {
            push_str_cmd(&mut cmds, LC_RPATH, rpath);
        }
        let dyld_info = DyldInfoCommand {
            cmd: LC_DYLD_INFO_ONLY,
            cmdsize: SIZEOF_DYLD_INFO_COMMAND as u32,
            rebase_off,
            rebase_size,
            bind_off,
            bind_size,
            weak_bind_off: weak_off,
            weak_bind_size: weak_size,
            lazy_bind_off: lazy_off,
            lazy_bind_size: lazy_size,
            export_off,
            export_size,
        };
        push_cmd(&mut cmds, dyld_info);
        push_cmd(&mut cmds, UuidCommand {
            cmd: LC_UUID,
            cmdsize: SIZEOF_UUID_COMMAND as u32,
            uuid: uuid_from(self.preferred_base, self.install_name.as_deref()),
        });
        if let Some(entryoff) = self.entry_offset {
            push_cmd(&mut cmds, EntryPointCommand {
                cmd: LC_MAIN,
                cmdsize: SIZEOF_ENTRY_POINT_COMMAND as u32,
                entryoff,
                stacksize: 0,
            });
        }

        let ncmds = count_cmds(&cmds);
        let mut flags = MH_DYLDLINK | MH_TWOLEVEL | self.extra_flags;
        if self.filetype == MH_EXECUTE {
            flags |= MH_PIE;
        }
        if !self.weak_strong_defs.is_empty() || self.exports.iter().any(|e| e.weak) {
            flags |= MH_WEAK_DEFINES;
        }
        if !self.weak_refs.is_empty() || !self.weak_strong_defs.is_empty() {
            flags |= MH_BINDS_TO_WEAK;
        }
        let header = Header64 {
            magic: MH_MAGIC_64,
            cputype: CPU_TYPE_X86_64,
            cpusubtype: CPU_SUBTYPE_X86_64_ALL,
            filetype: self.filetype,
            ncmds,
            sizeofcmds: cmds.len() as u32,
            flags,
            reserved: 0,
        };
        file.pwrite_with(header, 0, LE).unwrap();
        file[SIZEOF_HEADER_64..SIZEOF_HEADER_64 + cmds.len()].copy_from_slice(&cmds);
        file
    }

    pub fn write_to(&self, path: &Path) {
        fs::write(path, self.build()).unwrap();
    }

    /// The stream offset of each lazy bind record, in `lazy_binds` order
    /// (what a stub would push before entering the binder).
    pub fn lazy_offsets(&self) -> Vec<usize> {
        let sites: Vec<BindSite<'_>> = self
            .lazy_binds
            .iter()
            .map(|b| BindSite {
                segment: 1,
                offset: b.data_offset,
                ordinal: b.ordinal,
                symbol: &b.symbol,
                addend: 0,
                weak_import: b.weak_import,
            })
            .collect();
        bind::emit_lazy(&sites).1
    }
}

fn fixed16(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..name.len()].copy_from_slice(name.as_bytes());
    out
}

fn uuid_from(base: u64, name: Option<&str>) -> [u8; 16] {
    let mut uuid = [0u8; 16];
    uuid[..8].copy_from_slice(&base.to_le_bytes());
    if let Some(name) = name {
        for (i, b) in name.bytes().enumerate() {
            uuid[8 + (i % 8)] ^= b;
        }
    }
    uuid
}

fn section64(name: &str, seg: &str, addr: u64, size: u64, fileoff: u64, flags: u32) -> Section64 {
    Section64 {
        sectname: fixed16(name),
        segname: fixed16(seg),
        addr,
        size,
        offset: fileoff as u32,
        align: 3,
        reloff: 0,
        nreloc: 0,
        flags,
        reserved1: 0,
        reserved2: 0,
        reserved3: 0,
    }
}

fn push_segment(
    cmds: &mut Vec<u8>,
    name: &str,
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    prot: u32,
    sections: &[Section64],
) {
    let cmdsize = SIZEOF_SEGMENT_COMMAND_64 + sections.len() * SIZEOF_SECTION_64;
    let seg = SegmentCommand64 {
        cmd: LC_SEGMENT_64,
        cmdsize: cmdsize as u32,
        segname: fixed16(name),
        vmaddr,
        vmsize,
        fileoff,
        filesize,
        maxprot: prot | VM_PROT_WRITE,
        initprot: prot,
        nsects: sections.len() as u32,
        flags: 0,
    };
    let mut buf = vec![0u8; cmdsize];
    buf.pwrite_with(seg, 0, LE).unwrap();
    for (i, sect) in sections.iter().enumerate() {
        buf.pwrite_with(*sect, SIZEOF_SEGMENT_COMMAND_64 + i * SIZEOF_SECTION_64, LE)
            .unwrap();
    }
    cmds.extend_from_slice(&buf);
}

fn push_cmd<T: scroll::ctx::TryIntoCtx<scroll::Endian, Error = scroll::Error> + Copy>(
    cmds: &mut Vec<u8>,
    value: T,
) {
    let mut buf = vec![0u8; 256];
    let size = buf.pwrite_with(value, 0, LE).unwrap();
    cmds.extend_from_slice(&buf[..size]);
}

fn push_dylib_cmd(cmds: &mut Vec<u8>, cmd: u32, name: &str, compat: u32, current: u32) {
    let name_offset = SIZEOF_DYLIB_COMMAND;
    let cmdsize = align8(name_offset + name.len() + 1);
    let command = DylibCommand {
        cmd,
        cmdsize: cmdsize as u32,
        dylib: Dylib {
            name: name_offset as u32,
            timestamp: 2,
            current_version: current,
            compatibility_version: compat,
        },
    };
    let mut buf = vec![0u8; cmdsize];
    buf.pwrite_with(command, 0, LE).unwrap();
    buf[name_offset..name_offset + name.len()].copy_from_slice(name.as_bytes());
    cmds.extend_from_slice(&buf);
}

fn push_str_cmd(cmds: &mut Vec<u8>, cmd: u32, value: &str) {
    let value_offset = 12;
    let cmdsize = align8(value_offset + value.len() + 1);
    let mut buf = vec![0u8; cmdsize];
    buf.pwrite_with(cmd, 0, LE).unwrap();
    buf.pwrite_with(cmdsize as u32, 4, LE).unwrap();
    buf.pwrite_with(value_offset as u32, 8, LE).unwrap();
    buf[value_offset..value_offset + value.len()].copy_from_slice(value.as_bytes());
    cmds.extend_from_slice(&buf);
}

fn align8(len: usize) -> usize {
    (len + 7) & !7
}

/// Count commands by walking cmdsize fields.
fn count_cmds(cmds: &[u8]) -> u32 {
    let mut count = 0;
    let mut offset = 0;
    while offset + 8 <= cmds.len() {
        let size = u32::from_le_bytes(cmds[offset + 4..offset + 8].try_into().unwrap()) as usize;
        offset += size;
        count += 1;
    }
    count
}

///////////////////////////////////////////
// Linker helpers
///////////////////////////////////////////

pub type CallLog = Arc<Mutex<Vec<u64>>>;

/// A linker whose initializer runner records entry addresses instead of
/// jumping to them.
pub fn recording_linker() -> (Linker, CallLog) {
    let calls: CallLog = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&calls);
    let mut ctx = LinkContext::new(HOST);
    ctx.entropy = 0x5eed_1234_9876_abcd;
    ctx.initializer_runner = Box::new(move |address, _vars| {
        log.lock().unwrap().push(address);
    });
    (Linker::new(ctx), calls)
}

/// Map an image file and register it.
pub fn add_image(linker: &mut Linker, path: &Path, flags: ImageFlags) -> ImageId {
    let file = fs::File::open(path).unwrap();
    let meta = file.metadata().unwrap();
    let opts = LoadOptions {
        host: HOST,
        entropy: linker.ctx.next_entropy(linker.registry.len() as u64 + 1),
        flags,
    };
    let image = Image::load_from_file(path, &file, &meta, &opts).unwrap();
    linker.registry.add(image)
}

/// A fresh directory of image fixtures.
pub struct Fixture {
    pub dir: tempfile::TempDir,
}

impl Fixture {
    pub fn new() -> Fixture {
        Fixture {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn write(&self, name: &str, builder: &ImageBuilder) -> PathBuf {
        let path = self.path(name);
        builder.write_to(&path);
        path
    }
}

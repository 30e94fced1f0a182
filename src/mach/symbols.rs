//! "Nlist" style symbols: the classic symbol table consulted when an image
//! has no compressed LINKEDIT export trie, and the source of weak/ordinal
//! metadata bits for classic binding.

use core::fmt::{self, Debug};

use scroll::{Pread, Pwrite, SizeWith, ctx};

use crate::container::{self, Container};
use crate::error;
use crate::mach::load_command;
use crate::strtab::Strtab;

// n_type masks and values.
pub const N_STAB: u8 = 0xe0;
pub const N_PEXT: u8 = 0x10;
pub const N_TYPE: u8 = 0x0e;
pub const N_EXT: u8 = 0x01;

pub const N_UNDF: u8 = 0x0;
pub const N_ABS: u8 = 0x2;
pub const N_SECT: u8 = 0xe;
pub const N_PBUD: u8 = 0xc;
pub const N_INDR: u8 = 0xa;

// n_desc bits.
/// Reference is to a weak definition that may be coalesced away.
pub const N_WEAK_DEF: u16 = 0x0080;
/// Reference may be satisfied by a missing (zero) definition.
pub const N_WEAK_REF: u16 = 0x0040;
pub const N_ARM_THUMB_DEF: u16 = 0x0008;
pub const REFERENCED_DYNAMICALLY: u16 = 0x0010;

/// Two-level namespace: which dependency ordinal this undefined symbol is
/// expected in (high byte of `n_desc`).
#[inline]
pub fn library_ordinal(n_desc: u16) -> u8 {
    ((n_desc >> 8) & 0xff) as u8
}

pub const SELF_LIBRARY_ORDINAL: u8 = 0x0;
pub const DYNAMIC_LOOKUP_ORDINAL: u8 = 0xfe;
pub const EXECUTABLE_ORDINAL: u8 = 0xff;

#[repr(C)]
#[derive(Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct Nlist32 {
    /// index into the string table
    pub n_strx: u32,
    pub n_type: u8,
    /// section number or NO_SECT
    pub n_sect: u8,
    pub n_desc: u16,
    /// value of this symbol (or stab offset)
    pub n_value: u32,
}

pub const SIZEOF_NLIST_32: usize = 12;

impl Debug for Nlist32 {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "strx: {:04} type: {:#02x} sect: {:#x} desc: {:#03x} value: {:#x}",
            self.n_strx, self.n_type, self.n_sect, self.n_desc, self.n_value,
        )
    }
}

#[repr(C)]
#[derive(Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct Nlist64 {
    pub n_strx: u32,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u64,
}

pub const SIZEOF_NLIST_64: usize = 16;

impl Debug for Nlist64 {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "strx: {:04} type: {:#02x} sect: {:#x} desc: {:#03x} value: {:#x}",
            self.n_strx, self.n_type, self.n_sect, self.n_desc, self.n_value,
        )
    }
}

/// A width-unified nlist entry.
#[derive(Debug, Clone, Copy)]
pub struct Nlist {
    pub n_strx: usize,
    pub n_type: u8,
    pub n_sect: usize,
    pub n_desc: u16,
    pub n_value: u64,
}

impl Nlist {
    /// Is this a debugging (stab) entry?
    #[inline]
    pub fn is_stab(&self) -> bool {
        self.n_type & N_STAB != 0
    }

    #[inline]
    pub fn is_external(&self) -> bool {
        self.n_type & N_EXT != 0
    }

    #[inline]
    pub fn is_undefined(&self) -> bool {
        self.n_type & N_TYPE == N_UNDF
    }

    #[inline]
    pub fn is_weak_def(&self) -> bool {
        self.n_desc & N_WEAK_DEF != 0
    }

    #[inline]
    pub fn is_weak_ref(&self) -> bool {
        self.n_desc & N_WEAK_REF != 0
    }

    pub fn size_with(ctx: container::Ctx) -> usize {
        match ctx.container {
            Container::Little => SIZEOF_NLIST_32,
            Container::Big => SIZEOF_NLIST_64,
        }
    }
}

impl From<Nlist32> for Nlist {
    fn from(nlist: Nlist32) -> Self {
        Nlist {
            n_strx: nlist.n_strx as usize,
            n_type: nlist.n_type,
            n_sect: nlist.n_sect as usize,
            n_desc: nlist.n_desc,
            n_value: nlist.n_value as u64,
        }
    }
}

impl From<Nlist64> for Nlist {
    fn from(nlist: Nlist64) -> Self {
        Nlist {
            n_strx: nlist.n_strx as usize,
            n_type: nlist.n_type,
            n_sect: nlist.n_sect as usize,
            n_desc: nlist.n_desc,
            n_value: nlist.n_value,
        }
    }
}

/// A zero-copy nlist symbol table view over the LINKEDIT bytes, including
/// its string table.
#[derive(Clone, Copy)]
pub struct Symbols<'a> {
    data: &'a [u8],
    start: usize,
    nsyms: usize,
    strtab: Strtab<'a>,
    ctx: container::Ctx,
}

impl<'a> Symbols<'a> {
    /// `data` is the whole LINKEDIT-bearing byte view the symtab command
    /// offsets are relative to.
    pub fn parse(
        data: &'a [u8],
        symtab: &load_command::SymtabCommand,
        ctx: container::Ctx,
    ) -> error::Result<Symbols<'a>> {
        let sym_end = symtab.symoff as usize
            + symtab.nsyms as usize * Nlist::size_with(ctx);
        let str_end = symtab.stroff as usize + symtab.strsize as usize;
        if sym_end > data.len() || str_end > data.len() {
            return Err(error::Error::MalformedImage {
                path: Default::default(),
                reason: format!(
                    "symbol table [{:#x}; {}] or string table [{:#x}; {}] overruns linkedit",
                    symtab.symoff, symtab.nsyms, symtab.stroff, symtab.strsize
                ),
            });
        }
        Ok(Symbols {
            data,
            start: symtab.symoff as usize,
            nsyms: symtab.nsyms as usize,
            strtab: Strtab::new(&data[symtab.stroff as usize..str_end]),
            ctx,
        })
    }

    pub fn len(&self) -> usize {
        self.nsyms
    }

    pub fn is_empty(&self) -> bool {
        self.nsyms == 0
    }

    /// The `index`-th nlist entry with its name.
    pub fn get(&self, index: usize) -> error::Result<(&'a str, Nlist)> {
        if index >= self.nsyms {
            return Err(error::Error::MalformedImage {
                path: Default::default(),
                reason: format!("symbol index {} out of {}", index, self.nsyms),
            });
        }
        let offset = self.start + index * Nlist::size_with(self.ctx);
        let nlist: Nlist = match self.ctx.container {
            Container::Little => self.data.pread_with::<Nlist32>(offset, self.ctx.le)?.into(),
            Container::Big => self.data.pread_with::<Nlist64>(offset, self.ctx.le)?.into(),
        };
        let name = self.strtab.get_at(nlist.n_strx)?;
        Ok((name, nlist))
    }

    /// Binary search over a sorted exported-symbol range of the table
    /// (as delimited by the dysymtab); classic images keep their defined
    /// external symbols sorted by name.
    pub fn find_in_range(
        &self,
        name: &str,
        first: usize,
        count: usize,
    ) -> error::Result<Option<(usize, Nlist)>> {
        let mut lo = 0usize;
        let mut hi = count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (mid_name, nlist) = self.get(first + mid)?;
            match mid_name.cmp(name) {
                core::cmp::Ordering::Equal => return Ok(Some((first + mid, nlist))),
                core::cmp::Ordering::Less => lo = mid + 1,
                core::cmp::Ordering::Greater => hi = mid,
            }
        }
        Ok(None)
    }
}

impl<'a> Debug for Symbols<'a> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(fmt, "Symbols: {{")?;
        for i in 0..self.nsyms {
            match self.get(i) {
                Ok((name, nlist)) => writeln!(
                    fmt,
                    "{: >10x} {} sect: {:#x} type: {:#02x} desc: {:#03x}",
                    nlist.n_value, name, nlist.n_sect, nlist.n_type, nlist.n_desc
                )?,
                Err(error) => writeln!(fmt, "  bad symbol, index: {}, err: {:?}", i, error)?,
            }
        }
        writeln!(fmt, "}}")
    }
}

/// The value stored in an indirect-symbol-table slot for a local that
/// needs no binding.
pub const INDIRECT_SYMBOL_LOCAL: u32 = 0x8000_0000;
pub const INDIRECT_SYMBOL_ABS: u32 = 0x4000_0000;

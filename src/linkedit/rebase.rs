//! The rebase opcode stream: fixes up pointers inside an image to account
//! for slide.

use log::debug;

use crate::error::{self, Error};
use crate::linkedit::{Bytes, SegmentSpan, malformed, push_uleb128};

pub const REBASE_TYPE_POINTER: u8 = 1;
pub const REBASE_TYPE_TEXT_ABSOLUTE32: u8 = 2;
pub const REBASE_TYPE_TEXT_PCREL32: u8 = 3;

pub const REBASE_OPCODE_MASK: u8 = 0xF0;
pub const REBASE_IMMEDIATE_MASK: u8 = 0x0F;
pub const REBASE_OPCODE_DONE: u8 = 0x00;
pub const REBASE_OPCODE_SET_TYPE_IMM: u8 = 0x10;
pub const REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x20;
pub const REBASE_OPCODE_ADD_ADDR_ULEB: u8 = 0x30;
pub const REBASE_OPCODE_ADD_ADDR_IMM_SCALED: u8 = 0x40;
pub const REBASE_OPCODE_DO_REBASE_IMM_TIMES: u8 = 0x50;
pub const REBASE_OPCODE_DO_REBASE_ULEB_TIMES: u8 = 0x60;
pub const REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB: u8 = 0x70;
pub const REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB: u8 = 0x80;

/// One decoded rebase opcode. A well-formed stream of these re-emits
/// byte-exactly via [`emit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebaseOp {
    Done,
    SetType(u8),
    SetSegmentAndOffset { segment: u8, offset: u64 },
    AddAddr(u64),
    /// Advance the cursor by `imm` pointer widths.
    AddAddrImmScaled(u8),
    DoRebaseImm(u8),
    DoRebaseUleb(u64),
    /// One rebase, then advance by the operand plus a pointer width.
    DoRebaseAddAddrUleb(u64),
    DoRebaseUlebSkippingUleb { count: u64, skip: u64 },
}

/// Decode a rebase stream into its opcode list. Decoding stops after
/// `Done` or at the end of the stream.
pub fn opcodes(stream: &[u8]) -> error::Result<Vec<RebaseOp>> {
    let mut bytes = Bytes::new(stream);
    let mut ops = Vec::new();
    while !bytes.at_end() {
        let byte = bytes.u8()?;
        let immediate = byte & REBASE_IMMEDIATE_MASK;
        let op = match byte & REBASE_OPCODE_MASK {
            REBASE_OPCODE_DONE => {
                ops.push(RebaseOp::Done);
                break;
            }
            REBASE_OPCODE_SET_TYPE_IMM => RebaseOp::SetType(immediate),
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => RebaseOp::SetSegmentAndOffset {
                segment: immediate,
                offset: bytes.uleb128()?,
            },
            REBASE_OPCODE_ADD_ADDR_ULEB => RebaseOp::AddAddr(bytes.uleb128()?),
            REBASE_OPCODE_ADD_ADDR_IMM_SCALED => RebaseOp::AddAddrImmScaled(immediate),
            REBASE_OPCODE_DO_REBASE_IMM_TIMES => RebaseOp::DoRebaseImm(immediate),
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES => RebaseOp::DoRebaseUleb(bytes.uleb128()?),
            REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB => {
                RebaseOp::DoRebaseAddAddrUleb(bytes.uleb128()?)
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB => {
                RebaseOp::DoRebaseUlebSkippingUleb {
                    count: bytes.uleb128()?,
                    skip: bytes.uleb128()?,
                }
            }
            unknown => {
                return Err(Error::MalformedRebase {
                    path: Default::default(),
                    reason: format!("unknown rebase opcode {:#x}", unknown),
                });
            }
        };
        ops.push(op);
    }
    Ok(ops)
}

/// Re-emit an opcode list as stream bytes.
pub fn emit(ops: &[RebaseOp]) -> Vec<u8> {
    let mut out = Vec::new();
    for op in ops {
        match *op {
            RebaseOp::Done => out.push(REBASE_OPCODE_DONE),
            RebaseOp::SetType(t) => out.push(REBASE_OPCODE_SET_TYPE_IMM | t),
            RebaseOp::SetSegmentAndOffset { segment, offset } => {
                out.push(REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | segment);
                push_uleb128(&mut out, offset);
            }
            RebaseOp::AddAddr(delta) => {
                out.push(REBASE_OPCODE_ADD_ADDR_ULEB);
                push_uleb128(&mut out, delta);
            }
            RebaseOp::AddAddrImmScaled(imm) => {
                out.push(REBASE_OPCODE_ADD_ADDR_IMM_SCALED | imm);
            }
            RebaseOp::DoRebaseImm(imm) => out.push(REBASE_OPCODE_DO_REBASE_IMM_TIMES | imm),
            RebaseOp::DoRebaseUleb(count) => {
                out.push(REBASE_OPCODE_DO_REBASE_ULEB_TIMES);
                push_uleb128(&mut out, count);
            }
            RebaseOp::DoRebaseAddAddrUleb(delta) => {
                out.push(REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB);
                push_uleb128(&mut out, delta);
            }
            RebaseOp::DoRebaseUlebSkippingUleb { count, skip } => {
                out.push(REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB);
                push_uleb128(&mut out, count);
                push_uleb128(&mut out, skip);
            }
        }
    }
    out
}

/// One pointer-sized site that must be adjusted by slide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebaseFixup {
    /// Absolute (already slid) address of the site.
    pub address: u64,
    pub kind: u8,
}

/// Interpret a rebase stream against the segments the image actually
/// occupies, yielding every fix-up site. Every site is bounds-checked
/// against its segment's end; a site outside its segment is a
/// `MalformedRebase`.
pub fn fixups(
    stream: &[u8],
    segments: &[SegmentSpan],
    pointer_size: u64,
) -> error::Result<Vec<RebaseFixup>> {
    let ops = opcodes(stream)?;
    let mut fixups = Vec::new();
    let mut kind = REBASE_TYPE_POINTER;
    let mut segment: Option<SegmentSpan> = None;
    let mut address: u64 = 0;

    let mut one = |address: &mut u64, segment: &Option<SegmentSpan>, kind: u8| {
        let seg = (*segment).ok_or_else(|| {
            rebase_err("rebase before REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB")
        })?;
        if *address + pointer_size > seg.end() {
            return Err(rebase_err(&format!(
                "rebase site {:#x} outside its segment [{:#x}, {:#x})",
                address,
                seg.address,
                seg.end()
            )));
        }
        fixups.push(RebaseFixup {
            address: *address,
            kind,
        });
        *address += pointer_size;
        Ok::<_, Error>(())
    };

    for op in ops {
        match op {
            RebaseOp::Done => break,
            RebaseOp::SetType(t) => kind = t,
            RebaseOp::SetSegmentAndOffset {
                segment: index,
                offset,
            } => {
                let seg = segments.get(index as usize).ok_or_else(|| {
                    rebase_err(&format!(
                        "segment index {} out of {}",
                        index,
                        segments.len()
                    ))
                })?;
                segment = Some(*seg);
                address = seg.address + offset;
            }
            RebaseOp::AddAddr(delta) => address = address.wrapping_add(delta),
            RebaseOp::AddAddrImmScaled(imm) => {
                address = address.wrapping_add(u64::from(imm) * pointer_size)
            }
            RebaseOp::DoRebaseImm(imm) => {
                for _ in 0..imm {
                    one(&mut address, &segment, kind)?;
                }
            }
            RebaseOp::DoRebaseUleb(count) => {
                for _ in 0..count {
                    one(&mut address, &segment, kind)?;
                }
            }
            RebaseOp::DoRebaseAddAddrUleb(delta) => {
                one(&mut address, &segment, kind)?;
                address = address.wrapping_add(delta);
            }
            RebaseOp::DoRebaseUlebSkippingUleb { count, skip } => {
                for _ in 0..count {
                    one(&mut address, &segment, kind)?;
                    address = address.wrapping_add(skip);
                }
            }
        }
    }
    debug!(target: "rebasings", "{} rebase fixups decoded", fixups.len());
    Ok(fixups)
}

fn rebase_err(reason: &str) -> Error {
    Error::MalformedRebase {
        path: Default::default(),
        reason: reason.into(),
    }
}

/// Build a minimal stream describing `sites` (unslid segment offsets),
/// the shape the static linker would emit: one segment set per segment,
/// consecutive sites folded into counted runs.
pub fn emit_for_sites(sites: &[(u8, u64)], pointer_size: u64) -> Vec<u8> {
    let mut ops = vec![RebaseOp::SetType(REBASE_TYPE_POINTER)];
    let mut i = 0;
    while i < sites.len() {
        let (segment, offset) = sites[i];
        ops.push(RebaseOp::SetSegmentAndOffset { segment, offset });
        let mut run = 1u64;
        while i + (run as usize) < sites.len() {
            let (next_seg, next_off) = sites[i + run as usize];
            if next_seg == segment && next_off == offset + run * pointer_size {
                run += 1;
            } else {
                break;
            }
        }
        ops.push(RebaseOp::DoRebaseUleb(run));
        i += run as usize;
    }
    ops.push(RebaseOp::Done);
    emit(&ops)
}

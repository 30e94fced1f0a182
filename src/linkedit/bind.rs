//! The bind opcode streams: non-lazy, lazy, and weak. All three share one
//! opcode set; they differ in how records are delimited and which state
//! carries between records.

use log::debug;

use crate::error::{self, Error};
use crate::linkedit::{Bytes, SegmentSpan, push_sleb128, push_uleb128};

pub const BIND_TYPE_POINTER: u8 = 1;
pub const BIND_TYPE_TEXT_ABSOLUTE32: u8 = 2;
pub const BIND_TYPE_TEXT_PCREL32: u8 = 3;

pub const BIND_SPECIAL_DYLIB_SELF: i64 = 0;
pub const BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE: i64 = -1;
pub const BIND_SPECIAL_DYLIB_FLAT_LOOKUP: i64 = -2;

/// Missing resolution leaves zero instead of failing the load.
pub const BIND_SYMBOL_FLAGS_WEAK_IMPORT: u8 = 0x1;
/// In the weak stream: this image has a strong definition of the symbol.
pub const BIND_SYMBOL_FLAGS_NON_WEAK_DEFINITION: u8 = 0x8;

pub const BIND_OPCODE_MASK: u8 = 0xF0;
pub const BIND_IMMEDIATE_MASK: u8 = 0x0F;
pub const BIND_OPCODE_DONE: u8 = 0x00;
pub const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
pub const BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB: u8 = 0x20;
pub const BIND_OPCODE_SET_DYLIB_SPECIAL_IMM: u8 = 0x30;
pub const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
pub const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
pub const BIND_OPCODE_SET_ADDEND_SLEB: u8 = 0x60;
pub const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
pub const BIND_OPCODE_ADD_ADDR_ULEB: u8 = 0x80;
pub const BIND_OPCODE_DO_BIND: u8 = 0x90;
pub const BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB: u8 = 0xA0;
pub const BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED: u8 = 0xB0;
pub const BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB: u8 = 0xC0;

/// Whose exports a bind looks in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordinal {
    /// This image, then its re-exports.
    SelfImage,
    MainExecutable,
    /// Walk every image in registry order.
    FlatLookup,
    /// 1-based index into the image's static dependency table.
    Library(u16),
}

impl Ordinal {
    pub fn from_raw(raw: i64) -> error::Result<Ordinal> {
        match raw {
            BIND_SPECIAL_DYLIB_SELF => Ok(Ordinal::SelfImage),
            BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE => Ok(Ordinal::MainExecutable),
            BIND_SPECIAL_DYLIB_FLAT_LOOKUP => Ok(Ordinal::FlatLookup),
            n if n > 0 && n <= crate::mach::MAX_DEPENDENTS as i64 => Ok(Ordinal::Library(n as u16)),
            n => Err(bind_err(&format!("invalid library ordinal {}", n))),
        }
    }
}

/// One decoded bind opcode. A well-formed stream of these re-emits
/// byte-exactly via [`emit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOp<'a> {
    Done,
    SetDylibOrdinalImm(u8),
    SetDylibOrdinalUleb(u64),
    /// Signed immediate: 0, -1, or -2.
    SetDylibSpecialImm(i8),
    SetSymbol { name: &'a str, flags: u8 },
    SetType(u8),
    SetAddend(i64),
    SetSegmentAndOffset { segment: u8, offset: u64 },
    AddAddr(u64),
    DoBind,
    DoBindAddAddrUleb(u64),
    DoBindAddAddrImmScaled(u8),
    DoBindUlebTimesSkippingUleb { count: u64, skip: u64 },
}

/// Decode one opcode at the cursor, or `None` at end of stream.
fn decode_one<'a>(bytes: &mut Bytes<'a>) -> error::Result<Option<BindOp<'a>>> {
    if bytes.at_end() {
        return Ok(None);
    }
    let byte = bytes.u8()?;
    let immediate = byte & BIND_IMMEDIATE_MASK;
    let op = match byte & BIND_OPCODE_MASK {
        BIND_OPCODE_DONE => BindOp::Done,
        BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => BindOp::SetDylibOrdinalImm(immediate),
        BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => BindOp::SetDylibOrdinalUleb(bytes.uleb128()?),
        BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
            // Sign-extend the 4-bit immediate.
            let value = if immediate == 0 {
                0
            } else {
                (BIND_OPCODE_MASK | immediate) as i8
            };
            BindOp::SetDylibSpecialImm(value)
        }
        BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => BindOp::SetSymbol {
            flags: immediate,
            name: bytes.cstr()?,
        },
        BIND_OPCODE_SET_TYPE_IMM => BindOp::SetType(immediate),
        BIND_OPCODE_SET_ADDEND_SLEB => BindOp::SetAddend(bytes.sleb128()?),
        BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => BindOp::SetSegmentAndOffset {
            segment: immediate,
            offset: bytes.uleb128()?,
        },
        BIND_OPCODE_ADD_ADDR_ULEB => BindOp::AddAddr(bytes.uleb128()?),
        BIND_OPCODE_DO_BIND => BindOp::DoBind,
        BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => BindOp::DoBindAddAddrUleb(bytes.uleb128()?),
        BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => BindOp::DoBindAddAddrImmScaled(immediate),
        BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => BindOp::DoBindUlebTimesSkippingUleb {
            count: bytes.uleb128()?,
            skip: bytes.uleb128()?,
        },
        unknown => return Err(bind_err(&format!("unknown bind opcode {:#x}", unknown))),
    };
    Ok(Some(op))
}

/// Decode a whole stream into its opcode list, including every `Done`
/// (the lazy stream uses `Done` as a record separator, not a terminator).
pub fn opcodes(stream: &[u8]) -> error::Result<Vec<BindOp<'_>>> {
    let mut bytes = Bytes::new(stream);
    let mut ops = Vec::new();
    while let Some(op) = decode_one(&mut bytes)? {
        ops.push(op);
    }
    Ok(ops)
}

/// Re-emit an opcode list as stream bytes.
pub fn emit(ops: &[BindOp<'_>]) -> Vec<u8> {
    let mut out = Vec::new();
    for op in ops {
        match *op {
            BindOp::Done => out.push(BIND_OPCODE_DONE),
            BindOp::SetDylibOrdinalImm(imm) => out.push(BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | imm),
            BindOp::SetDylibOrdinalUleb(ordinal) => {
                out.push(BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB);
                push_uleb128(&mut out, ordinal);
            }
            BindOp::SetDylibSpecialImm(value) => {
                out.push(BIND_OPCODE_SET_DYLIB_SPECIAL_IMM | (value as u8 & BIND_IMMEDIATE_MASK));
            }
            BindOp::SetSymbol { name, flags } => {
                out.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM | flags);
                out.extend_from_slice(name.as_bytes());
                out.push(0);
            }
            BindOp::SetType(t) => out.push(BIND_OPCODE_SET_TYPE_IMM | t),
            BindOp::SetAddend(addend) => {
                out.push(BIND_OPCODE_SET_ADDEND_SLEB);
                push_sleb128(&mut out, addend);
            }
            BindOp::SetSegmentAndOffset { segment, offset } => {
                out.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | segment);
                push_uleb128(&mut out, offset);
            }
            BindOp::AddAddr(delta) => {
                out.push(BIND_OPCODE_ADD_ADDR_ULEB);
                push_uleb128(&mut out, delta);
            }
            BindOp::DoBind => out.push(BIND_OPCODE_DO_BIND),
            BindOp::DoBindAddAddrUleb(delta) => {
                out.push(BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB);
                push_uleb128(&mut out, delta);
            }
            BindOp::DoBindAddAddrImmScaled(imm) => {
                out.push(BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED | imm);
            }
            BindOp::DoBindUlebTimesSkippingUleb { count, skip } => {
                out.push(BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB);
                push_uleb128(&mut out, count);
                push_uleb128(&mut out, skip);
            }
        }
    }
    out
}

/// One site to bind: a symbolic reference plus where to write the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRecord<'a> {
    /// Absolute (already slid) address of the pointer slot.
    pub address: u64,
    pub segment_index: u8,
    pub segment_offset: u64,
    pub kind: u8,
    pub ordinal: Ordinal,
    pub symbol: &'a str,
    pub addend: i64,
    pub weak_import: bool,
}

#[derive(Debug, Clone, Copy)]
struct BindState<'a> {
    ordinal: Ordinal,
    symbol: Option<&'a str>,
    flags: u8,
    kind: u8,
    addend: i64,
    segment: Option<(u8, SegmentSpan)>,
    address: u64,
    segment_offset: u64,
}

impl<'a> BindState<'a> {
    fn new() -> Self {
        BindState {
            ordinal: Ordinal::SelfImage,
            symbol: None,
            flags: 0,
            kind: BIND_TYPE_POINTER,
            addend: 0,
            segment: None,
            address: 0,
            segment_offset: 0,
        }
    }

    fn set_segment(&mut self, index: u8, offset: u64, segments: &[SegmentSpan]) -> error::Result<()> {
        let seg = segments.get(index as usize).ok_or_else(|| {
            bind_err(&format!("segment index {} out of {}", index, segments.len()))
        })?;
        self.segment = Some((index, *seg));
        self.segment_offset = offset;
        self.address = seg.address + offset;
        Ok(())
    }

    fn advance(&mut self, delta: u64) {
        self.address = self.address.wrapping_add(delta);
        self.segment_offset = self.segment_offset.wrapping_add(delta);
    }

    fn record(&self, pointer_size: u64) -> error::Result<BindRecord<'a>> {
        let (index, seg) = self
            .segment
            .ok_or_else(|| bind_err("bind before BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB"))?;
        if self.address + pointer_size > seg.end() {
            return Err(bind_err(&format!(
                "bind site {:#x} outside its segment [{:#x}, {:#x})",
                self.address,
                seg.address,
                seg.end()
            )));
        }
        let symbol = self
            .symbol
            .ok_or_else(|| bind_err("bind before BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM"))?;
        Ok(BindRecord {
            address: self.address,
            segment_index: index,
            segment_offset: self.segment_offset,
            kind: self.kind,
            ordinal: self.ordinal,
            symbol,
            addend: self.addend,
            weak_import: self.flags & BIND_SYMBOL_FLAGS_WEAK_IMPORT != 0,
        })
    }
}

fn apply_op<'a>(
    state: &mut BindState<'a>,
    op: &BindOp<'a>,
    segments: &[SegmentSpan],
    pointer_size: u64,
    records: &mut Vec<BindRecord<'a>>,
) -> error::Result<()> {
    match *op {
        BindOp::Done => {}
        BindOp::SetDylibOrdinalImm(imm) => state.ordinal = Ordinal::from_raw(imm as i64)?,
        BindOp::SetDylibOrdinalUleb(ordinal) => {
            state.ordinal = Ordinal::from_raw(ordinal as i64)?
        }
        BindOp::SetDylibSpecialImm(value) => state.ordinal = Ordinal::from_raw(value as i64)?,
        BindOp::SetSymbol { name, flags } => {
            state.symbol = Some(name);
            state.flags = flags;
        }
        BindOp::SetType(t) => state.kind = t,
        BindOp::SetAddend(addend) => state.addend = addend,
        BindOp::SetSegmentAndOffset { segment, offset } => {
            state.set_segment(segment, offset, segments)?
        }
        BindOp::AddAddr(delta) => state.advance(delta),
        BindOp::DoBind => {
            records.push(state.record(pointer_size)?);
            state.advance(pointer_size);
        }
        BindOp::DoBindAddAddrUleb(delta) => {
            records.push(state.record(pointer_size)?);
            state.advance(pointer_size.wrapping_add(delta));
        }
        BindOp::DoBindAddAddrImmScaled(imm) => {
            records.push(state.record(pointer_size)?);
            state.advance(pointer_size + u64::from(imm) * pointer_size);
        }
        BindOp::DoBindUlebTimesSkippingUleb { count, skip } => {
            for _ in 0..count {
                records.push(state.record(pointer_size)?);
                state.advance(pointer_size.wrapping_add(skip));
            }
        }
    }
    Ok(())
}

/// Interpret a non-lazy bind stream: state carries between records and a
/// `Done` terminates it.
pub fn records<'a>(
    stream: &'a [u8],
    segments: &[SegmentSpan],
    pointer_size: u64,
) -> error::Result<Vec<BindRecord<'a>>> {
    let mut state = BindState::new();
    let mut records = Vec::new();
    let mut bytes = Bytes::new(stream);
    while let Some(op) = decode_one(&mut bytes)? {
        if matches!(op, BindOp::Done) {
            break;
        }
        apply_op(&mut state, &op, segments, pointer_size, &mut records)?;
    }
    debug!(target: "bindings", "{} bind records decoded", records.len());
    Ok(records)
}

/// Interpret the single lazy-bind record starting at `offset`. Lazy
/// records are self-contained (no state carries from earlier records) and
/// each is terminated by `Done`.
pub fn lazy_record_at<'a>(
    stream: &'a [u8],
    offset: usize,
    segments: &[SegmentSpan],
    pointer_size: u64,
) -> error::Result<BindRecord<'a>> {
    if offset >= stream.len() {
        return Err(bind_err(&format!(
            "lazy bind offset {:#x} outside stream of {:#x} bytes",
            offset,
            stream.len()
        )));
    }
    let mut state = BindState::new();
    let mut records = Vec::new();
    let mut bytes = Bytes::new(stream);
    bytes.seek(offset);
    while let Some(op) = decode_one(&mut bytes)? {
        if matches!(op, BindOp::Done) {
            break;
        }
        apply_op(&mut state, &op, segments, pointer_size, &mut records)?;
    }
    match records.len() {
        1 => Ok(records.remove(0)),
        n => Err(bind_err(&format!(
            "lazy bind record at {:#x} performed {} binds",
            offset, n
        ))),
    }
}

/// Interpret every record in the lazy stream, with the stream offset each
/// record starts at; used when lazy binding is forced at launch and by
/// the round-trip tooling.
pub fn lazy_records<'a>(
    stream: &'a [u8],
    segments: &[SegmentSpan],
    pointer_size: u64,
) -> error::Result<Vec<(usize, BindRecord<'a>)>> {
    let mut out = Vec::new();
    let mut bytes = Bytes::new(stream);
    let mut start = 0usize;
    let mut state = BindState::new();
    let mut records = Vec::new();
    loop {
        // Skip trailing zero padding: a record starting with DONE is the
        // end of the whole sequence.
        if bytes.at_end() {
            break;
        }
        let op = match decode_one(&mut bytes)? {
            Some(op) => op,
            None => break,
        };
        if matches!(op, BindOp::Done) {
            state = BindState::new();
            start = bytes.position();
            continue;
        }
        apply_op(&mut state, &op, segments, pointer_size, &mut records)?;
        if !records.is_empty() {
            for record in records.drain(..) {
                out.push((start, record));
            }
        }
    }
    Ok(out)
}

fn bind_err(reason: &str) -> Error {
    Error::MalformedImage {
        path: Default::default(),
        reason: reason.into(),
    }
}

///////////////////////////////////////////
// Weak stream
///////////////////////////////////////////

/// One symbol's worth of the weak-bind stream: either a marker that this
/// image has a strong definition of `name`, or the list of sites in this
/// image that must be re-pointed at whatever definition coalescing picks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeakEntry<'a> {
    pub name: &'a str,
    /// `BIND_SYMBOL_FLAGS_NON_WEAK_DEFINITION`: the image's definition is
    /// strong and must win coalescing.
    pub strong_definition: bool,
    pub sites: Vec<BindRecord<'a>>,
}

/// A cursor over one image's weak-bind stream, advanced symbol by symbol
/// during the process-wide coalescing merge.
pub struct WeakBindCursor<'a> {
    bytes: Bytes<'a>,
    segments: Vec<SegmentSpan>,
    pointer_size: u64,
    state: BindState<'a>,
    pending: Option<(&'a str, u8)>,
    done: bool,
}

impl<'a> WeakBindCursor<'a> {
    pub fn new(stream: &'a [u8], segments: &[SegmentSpan], pointer_size: u64) -> Self {
        WeakBindCursor {
            bytes: Bytes::new(stream),
            segments: segments.to_vec(),
            pointer_size,
            state: BindState::new(),
            pending: None,
            done: false,
        }
    }

    /// Advance to the next symbol in the stream, collecting its sites.
    pub fn next_symbol(&mut self) -> error::Result<Option<WeakEntry<'a>>> {
        if self.done {
            return Ok(None);
        }
        // Find the symbol this entry describes.
        let (name, flags) = match self.pending.take() {
            Some(pending) => pending,
            None => loop {
                match decode_one(&mut self.bytes)? {
                    None | Some(BindOp::Done) => {
                        self.done = true;
                        return Ok(None);
                    }
                    Some(BindOp::SetSymbol { name, flags }) => break (name, flags),
                    Some(op) => {
                        // Leading state (type, segment) before the first
                        // symbol.
                        apply_op(
                            &mut self.state,
                            &op,
                            &self.segments,
                            self.pointer_size,
                            &mut Vec::new(),
                        )?;
                    }
                }
            },
        };
        self.state.symbol = Some(name);
        self.state.flags = flags;
        let mut sites = Vec::new();
        // Collect ops until the next symbol or the end.
        loop {
            match decode_one(&mut self.bytes)? {
                None | Some(BindOp::Done) => {
                    self.done = true;
                    break;
                }
                Some(BindOp::SetSymbol { name, flags }) => {
                    self.pending = Some((name, flags));
                    break;
                }
                Some(op) => apply_op(
                    &mut self.state,
                    &op,
                    &self.segments,
                    self.pointer_size,
                    &mut sites,
                )?,
            }
        }
        Ok(Some(WeakEntry {
            name,
            strong_definition: flags & BIND_SYMBOL_FLAGS_NON_WEAK_DEFINITION != 0,
            sites,
        }))
    }
}

///////////////////////////////////////////
// Stream builders for tooling and tests
///////////////////////////////////////////

/// A symbolic reference to encode into a bind stream.
#[derive(Debug, Clone)]
pub struct BindSite<'a> {
    pub segment: u8,
    pub offset: u64,
    pub ordinal: Ordinal,
    pub symbol: &'a str,
    pub addend: i64,
    pub weak_import: bool,
}

fn ordinal_ops<'a>(ordinal: Ordinal, ops: &mut Vec<BindOp<'a>>) {
    match ordinal {
        Ordinal::SelfImage => ops.push(BindOp::SetDylibSpecialImm(0)),
        Ordinal::MainExecutable => ops.push(BindOp::SetDylibSpecialImm(-1)),
        Ordinal::FlatLookup => ops.push(BindOp::SetDylibSpecialImm(-2)),
        Ordinal::Library(n) if n <= BIND_IMMEDIATE_MASK as u16 => {
            ops.push(BindOp::SetDylibOrdinalImm(n as u8))
        }
        Ordinal::Library(n) => ops.push(BindOp::SetDylibOrdinalUleb(n as u64)),
    }
}

/// Emit a non-lazy bind stream for `sites`.
pub fn emit_for_sites<'a>(sites: &[BindSite<'a>]) -> Vec<u8> {
    let mut ops = vec![BindOp::SetType(BIND_TYPE_POINTER)];
    for site in sites {
        ordinal_ops(site.ordinal, &mut ops);
        ops.push(BindOp::SetSymbol {
            name: site.symbol,
            flags: if site.weak_import {
                BIND_SYMBOL_FLAGS_WEAK_IMPORT
            } else {
                0
            },
        });
        if site.addend != 0 {
            ops.push(BindOp::SetAddend(site.addend));
        }
        ops.push(BindOp::SetSegmentAndOffset {
            segment: site.segment,
            offset: site.offset,
        });
        ops.push(BindOp::DoBind);
    }
    ops.push(BindOp::Done);
    emit(&ops)
}

/// Emit a lazy-bind stream; returns the stream plus each site's record
/// offset (the value a stub pushes before entering the binder).
pub fn emit_lazy<'a>(sites: &[BindSite<'a>]) -> (Vec<u8>, Vec<usize>) {
    let mut out = Vec::new();
    let mut offsets = Vec::with_capacity(sites.len());
    for site in sites {
        offsets.push(out.len());
        let mut ops = Vec::new();
        ops.push(BindOp::SetSegmentAndOffset {
            segment: site.segment,
            offset: site.offset,
        });
        ordinal_ops(site.ordinal, &mut ops);
        ops.push(BindOp::SetSymbol {
            name: site.symbol,
            flags: if site.weak_import {
                BIND_SYMBOL_FLAGS_WEAK_IMPORT
            } else {
                0
            },
        });
        ops.push(BindOp::DoBind);
        ops.push(BindOp::Done);
        out.extend_from_slice(&emit(&ops));
    }
    (out, offsets)
}

/// Emit a weak-bind stream: strong-definition markers first, then
/// per-symbol reference sites, the order the static linker uses.
pub fn emit_weak<'a>(strong_defs: &[&'a str], refs: &[BindSite<'a>]) -> Vec<u8> {
    let mut ops = Vec::new();
    for name in strong_defs {
        ops.push(BindOp::SetSymbol {
            name,
            flags: BIND_SYMBOL_FLAGS_NON_WEAK_DEFINITION,
        });
    }
    ops.push(BindOp::SetType(BIND_TYPE_POINTER));
    let mut current: Option<&str> = None;
    for site in refs {
        // Consecutive sites for one symbol share a single SetSymbol.
        if current != Some(site.symbol) {
            ops.push(BindOp::SetSymbol {
                name: site.symbol,
                flags: 0,
            });
            current = Some(site.symbol);
        }
        ops.push(BindOp::SetSegmentAndOffset {
            segment: site.segment,
            offset: site.offset,
        });
        ops.push(BindOp::DoBind);
    }
    ops.push(BindOp::Done);
    emit(&ops)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans() -> [SegmentSpan; 2] {
        [
            SegmentSpan {
                address: 0x1000,
                size: 0x1000,
            },
            SegmentSpan {
                address: 0x4000,
                size: 0x1000,
            },
        ]
    }

    #[test]
    fn opcode_stream_roundtrips() {
        let ops = vec![
            BindOp::SetType(BIND_TYPE_POINTER),
            BindOp::SetDylibOrdinalImm(1),
            BindOp::SetSymbol {
                name: "_malloc",
                flags: 0,
            },
            BindOp::SetSegmentAndOffset {
                segment: 1,
                offset: 0x10,
            },
            BindOp::DoBind,
            BindOp::SetDylibSpecialImm(-2),
            BindOp::SetSymbol {
                name: "_weak_thing",
                flags: BIND_SYMBOL_FLAGS_WEAK_IMPORT,
            },
            BindOp::SetAddend(-8),
            BindOp::DoBindAddAddrUleb(0x20),
            BindOp::Done,
        ];
        let stream = emit(&ops);
        let decoded = opcodes(&stream).unwrap();
        assert_eq!(decoded, ops);
        assert_eq!(emit(&decoded), stream);
    }

    #[test]
    fn records_carry_state() {
        let sites = [
            BindSite {
                segment: 1,
                offset: 0x10,
                ordinal: Ordinal::Library(1),
                symbol: "_malloc",
                addend: 0,
                weak_import: false,
            },
            BindSite {
                segment: 1,
                offset: 0x18,
                ordinal: Ordinal::Library(2),
                symbol: "_free",
                addend: 0,
                weak_import: false,
            },
        ];
        let stream = emit_for_sites(&sites);
        let records = records(&stream, &spans(), 8).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].address, 0x4010);
        assert_eq!(records[0].symbol, "_malloc");
        assert_eq!(records[0].ordinal, Ordinal::Library(1));
        assert_eq!(records[1].address, 0x4018);
        assert_eq!(records[1].ordinal, Ordinal::Library(2));
    }

    #[test]
    fn lazy_records_are_self_contained() {
        let sites = [
            BindSite {
                segment: 1,
                offset: 0x20,
                ordinal: Ordinal::Library(1),
                symbol: "_printf",
                addend: 0,
                weak_import: false,
            },
            BindSite {
                segment: 1,
                offset: 0x28,
                ordinal: Ordinal::Library(1),
                symbol: "_puts",
                addend: 0,
                weak_import: false,
            },
        ];
        let (stream, offsets) = emit_lazy(&sites);
        let record = lazy_record_at(&stream, offsets[1], &spans(), 8).unwrap();
        assert_eq!(record.symbol, "_puts");
        assert_eq!(record.address, 0x4028);

        let all = lazy_records(&stream, &spans(), 8).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, offsets[0]);
        assert_eq!(all[1].0, offsets[1]);
    }

    #[test]
    fn weak_cursor_walks_symbols() {
        let stream = emit_weak(
            &["_strong"],
            &[
                BindSite {
                    segment: 0,
                    offset: 0x100,
                    ordinal: Ordinal::SelfImage,
                    symbol: "_shared",
                    addend: 0,
                    weak_import: false,
                },
                BindSite {
                    segment: 0,
                    offset: 0x108,
                    ordinal: Ordinal::SelfImage,
                    symbol: "_shared",
                    addend: 0,
                    weak_import: false,
                },
            ],
        );
        let mut cursor = WeakBindCursor::new(&stream, &spans(), 8);
        let first = cursor.next_symbol().unwrap().unwrap();
        assert_eq!(first.name, "_strong");
        assert!(first.strong_definition);
        assert!(first.sites.is_empty());
        let second = cursor.next_symbol().unwrap().unwrap();
        assert_eq!(second.name, "_shared");
        assert!(!second.strong_definition);
        assert_eq!(second.sites.len(), 2);
        assert_eq!(second.sites[0].address, 0x1100);
        assert_eq!(second.sites[1].address, 0x1108);
        assert!(cursor.next_symbol().unwrap().is_none());
    }

    #[test]
    fn invalid_ordinal_rejected() {
        assert!(Ordinal::from_raw(-3).is_err());
        assert!(Ordinal::from_raw(0x10000).is_err());
    }

    #[test]
    fn out_of_segment_bind_fails() {
        let sites = [BindSite {
            segment: 0,
            offset: 0xfff8,
            ordinal: Ordinal::Library(1),
            symbol: "_oob",
            addend: 0,
            weak_import: false,
        }];
        let stream = emit_for_sites(&sites);
        assert!(records(&stream, &spans(), 8).is_err());
    }
}

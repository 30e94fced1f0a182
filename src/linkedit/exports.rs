//! The export trie: a compacted prefix tree mapping symbol names to their
//! definitions within one image. Lookup cost is linear in the length of
//! the symbol name.

use crate::error;
use crate::linkedit::{Bytes, malformed, push_uleb128};

pub const EXPORT_SYMBOL_FLAGS_KIND_MASK: u64 = 0x03;
pub const EXPORT_SYMBOL_FLAGS_KIND_REGULAR: u64 = 0x00;
pub const EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL: u64 = 0x01;
/// Definition may be coalesced away by a duplicate.
pub const EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION: u64 = 0x04;
/// The "definition" is actually in a dependent dylib.
pub const EXPORT_SYMBOL_FLAGS_REEXPORT: u64 = 0x08;
/// The payload carries a stub offset and a resolver offset.
pub const EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER: u64 = 0x10;

/// What an exported name resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportInfo<'a> {
    /// Offset from the image base.
    Regular { offset: u64 },
    /// Call the resolver at runtime to produce the real target.
    StubAndResolver { stub_offset: u64, resolver_offset: u64 },
    /// Defined in the dependency with this ordinal, possibly under
    /// another name (empty = same name).
    Reexport { ordinal: u64, name: &'a str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export<'a> {
    pub flags: u64,
    pub info: ExportInfo<'a>,
}

impl<'a> Export<'a> {
    #[inline]
    pub fn is_weak(&self) -> bool {
        self.flags & EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION != 0
    }

    #[inline]
    pub fn is_reexport(&self) -> bool {
        self.flags & EXPORT_SYMBOL_FLAGS_REEXPORT != 0
    }
}

/// A zero-copy walker over trie bytes.
#[derive(Debug, Clone, Copy)]
pub struct ExportTrie<'a> {
    data: &'a [u8],
}

impl<'a> ExportTrie<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        ExportTrie { data }
    }

    /// Look up one symbol. `Ok(None)` when the image does not export it.
    pub fn find(&self, name: &str) -> error::Result<Option<Export<'a>>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        let mut node_offset = 0usize;
        let mut remaining = name.as_bytes();
        loop {
            let mut bytes = Bytes::new(self.data);
            bytes.seek(node_offset);
            let terminal_size = bytes.uleb128()? as usize;
            if remaining.is_empty() {
                if terminal_size == 0 {
                    return Ok(None);
                }
                return Ok(Some(self.read_terminal(&mut bytes)?));
            }
            // Skip the terminal payload to reach the children.
            bytes.seek(bytes.position() + terminal_size);
            let child_count = bytes.u8()?;
            let mut next: Option<usize> = None;
            for _ in 0..child_count {
                let edge = bytes.cstr()?;
                let child_offset = bytes.uleb128()? as usize;
                if next.is_none() && remaining.starts_with(edge.as_bytes()) && !edge.is_empty() {
                    remaining = &remaining[edge.len()..];
                    next = Some(child_offset);
                }
            }
            match next {
                Some(offset) if offset < self.data.len() => node_offset = offset,
                Some(offset) => {
                    return Err(malformed(&format!(
                        "export trie child offset {:#x} outside trie",
                        offset
                    )));
                }
                None => return Ok(None),
            }
        }
    }

    fn read_terminal(&self, bytes: &mut Bytes<'a>) -> error::Result<Export<'a>> {
        let flags = bytes.uleb128()?;
        let info = if flags & EXPORT_SYMBOL_FLAGS_REEXPORT != 0 {
            ExportInfo::Reexport {
                ordinal: bytes.uleb128()?,
                name: bytes.cstr()?,
            }
        } else if flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER != 0 {
            ExportInfo::StubAndResolver {
                stub_offset: bytes.uleb128()?,
                resolver_offset: bytes.uleb128()?,
            }
        } else {
            ExportInfo::Regular {
                offset: bytes.uleb128()?,
            }
        };
        Ok(Export { flags, info })
    }

    /// Enumerate every export in the trie, depth-first.
    pub fn exports(&self) -> error::Result<Vec<(String, Export<'a>)>> {
        let mut out = Vec::new();
        if self.data.is_empty() {
            return Ok(out);
        }
        // Guard against cycles: each node may be visited once.
        let mut seen = vec![false; self.data.len()];
        self.walk(0, String::new(), &mut seen, &mut out)?;
        Ok(out)
    }

    fn walk(
        &self,
        node_offset: usize,
        prefix: String,
        seen: &mut [bool],
        out: &mut Vec<(String, Export<'a>)>,
    ) -> error::Result<()> {
        if node_offset >= self.data.len() || std::mem::replace(&mut seen[node_offset], true) {
            return Err(malformed("export trie is cyclic or truncated"));
        }
        let mut bytes = Bytes::new(self.data);
        bytes.seek(node_offset);
        let terminal_size = bytes.uleb128()? as usize;
        if terminal_size != 0 {
            let mut terminal = bytes;
            out.push((prefix.clone(), self.read_terminal(&mut terminal)?));
        }
        bytes.seek(bytes.position() + terminal_size);
        let child_count = bytes.u8()?;
        for _ in 0..child_count {
            let edge = bytes.cstr()?;
            let child_offset = bytes.uleb128()? as usize;
            let mut child_prefix = prefix.clone();
            child_prefix.push_str(edge);
            self.walk(child_offset, child_prefix, seen, out)?;
        }
        Ok(())
    }
}

///////////////////////////////////////////
// Builder
///////////////////////////////////////////

/// What a built trie exports; the owned mirror of [`ExportInfo`].
#[derive(Debug, Clone)]
pub enum BuiltExport {
    Regular { offset: u64, flags: u64 },
    Reexport { ordinal: u64, name: String, flags: u64 },
}

#[derive(Default)]
struct Node {
    terminal: Option<BuiltExport>,
    children: Vec<(String, Node)>,
    // Assigned during layout.
    offset: usize,
    size: usize,
}

/// Builds trie bytes from a set of exported symbols. The layout is
/// canonical: children are emitted in insertion-split order and node
/// offsets are stabilized the way the static linker does it, so building
/// the decoded contents of a built trie reproduces it byte-exactly.
#[derive(Default)]
pub struct TrieBuilder {
    root: Node,
}

impl TrieBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add(&mut self, name: &str, export: BuiltExport) {
        insert(&mut self.root, name, export);
    }

    pub fn encode(mut self) -> Vec<u8> {
        // Offsets are ulebs whose width depends on the offsets themselves;
        // iterate layout until sizes stop moving.
        loop {
            let mut offset = 0usize;
            let mut moved = false;
            layout(&mut self.root, &mut offset, &mut moved);
            if !moved {
                break;
            }
        }
        let mut out = Vec::new();
        write_node(&self.root, &mut out);
        out
    }
}

fn insert(node: &mut Node, name: &str, export: BuiltExport) {
    if name.is_empty() {
        node.terminal = Some(export);
        return;
    }
    for i in 0..node.children.len() {
        let common = {
            let (edge, _) = &node.children[i];
            common_prefix_len(edge, name)
        };
        if common == 0 {
            continue;
        }
        let (edge, _) = &node.children[i];
        if common == edge.len() {
            // Descend.
            let rest = name[common..].to_string();
            insert(&mut node.children[i].1, &rest, export);
            return;
        }
        // Split the edge.
        let (edge, old_child) = node.children.remove(i);
        let mut mid = Node::default();
        mid.children.push((edge[common..].to_string(), old_child));
        insert(&mut mid, &name[common..], export);
        node.children.insert(i, (edge[..common].to_string(), mid));
        return;
    }
    let mut leaf = Node::default();
    leaf.terminal = Some(export);
    node.children.push((name.to_string(), leaf));
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}

fn uleb_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

fn terminal_payload(export: &BuiltExport) -> Vec<u8> {
    let mut payload = Vec::new();
    match export {
        BuiltExport::Regular { offset, flags } => {
            push_uleb128(&mut payload, *flags);
            push_uleb128(&mut payload, *offset);
        }
        BuiltExport::Reexport {
            ordinal,
            name,
            flags,
        } => {
            push_uleb128(&mut payload, *flags | EXPORT_SYMBOL_FLAGS_REEXPORT);
            push_uleb128(&mut payload, *ordinal);
            payload.extend_from_slice(name.as_bytes());
            payload.push(0);
        }
    }
    payload
}

fn layout(node: &mut Node, offset: &mut usize, moved: &mut bool) {
    if node.offset != *offset {
        node.offset = *offset;
        *moved = true;
    }
    let payload = node.terminal.as_ref().map(terminal_payload);
    let mut size = match &payload {
        Some(p) => uleb_len(p.len() as u64) + p.len(),
        None => 1,
    };
    size += 1; // child count
    for (edge, child) in &node.children {
        size += edge.len() + 1 + uleb_len(child.offset as u64);
    }
    if node.size != size {
        node.size = size;
        *moved = true;
    }
    *offset += size;
    for (_, child) in node.children.iter_mut() {
        layout(child, offset, moved);
    }
}

fn write_node(node: &Node, out: &mut Vec<u8>) {
    match &node.terminal {
        Some(export) => {
            let payload = terminal_payload(export);
            push_uleb128(out, payload.len() as u64);
            out.extend_from_slice(&payload);
        }
        None => out.push(0),
    }
    out.push(node.children.len() as u8);
    for (edge, child) in &node.children {
        out.extend_from_slice(edge.as_bytes());
        out.push(0);
        push_uleb128(out, child.offset as u64);
    }
    for (_, child) in &node.children {
        write_node(child, out);
    }
}

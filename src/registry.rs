//! The process-wide set of loaded images: append-order list, dependency
//! graph, fast address→image lookup, and the debugger-visible projection.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::EdgeRef;

use crate::error::ErrorKind;
use crate::image::{Image, ImageId};

/// Why two images are connected in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepEdge {
    /// From the image's dependency table; `ordinal` is its 1-based index
    /// there.
    Static { ordinal: u16, upward: bool },
    /// Recorded when a flat or coalesced lookup bound against an image
    /// that is not a static dependency; keeps the target alive across GC.
    Dynamic,
}

/// The image registry. All mutation happens under the linker's writer
/// lock; the range index alone is also readable without it.
pub struct Registry {
    graph: StableDiGraph<Image, DepEdge>,
    load_order: Vec<ImageId>,
    by_ident: HashMap<(u64, u64), ImageId>,
    by_install_name: HashMap<String, ImageId>,
    ranges: RangeIndex,
    pub debugger: DebuggerInfo,
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            graph: StableDiGraph::new(),
            load_order: Vec::new(),
            by_ident: HashMap::new(),
            by_install_name: HashMap::new(),
            ranges: RangeIndex::new(),
            debugger: DebuggerInfo::new(),
        }
    }

    /// Register a freshly mapped image: appends to the load order, indexes
    /// its identity and accessible segments, and republishes the debugger
    /// info.
    pub fn add(&mut self, image: Image) -> ImageId {
        let ident = (image.device, image.inode);
        let install_name = image.install_name.clone();
        let id = self.graph.add_node(image);
        self.load_order.push(id);
        if ident != (0, 0) {
            self.by_ident.insert(ident, id);
        }
        if let Some(name) = install_name {
            // First registration wins; a duplicate install name resolves
            // to the already-loaded image.
            self.by_install_name.entry(name).or_insert(id);
        }
        for segment in self.graph[id].mapping.segments() {
            if segment.is_accessible() {
                self.ranges.insert(segment.address, segment.end(), id);
            }
        }
        self.republish_debugger_info();
        id
    }

    /// Remove an unloaded image. The caller has already run terminators
    /// and decided whether the pages stay mapped.
    pub fn remove(&mut self, id: ImageId) -> Option<Image> {
        self.ranges.remove_image(id);
        self.load_order.retain(|&other| other != id);
        self.by_ident.retain(|_, &mut other| other != id);
        self.by_install_name.retain(|_, &mut other| other != id);
        let image = self.graph.remove_node(id);
        self.republish_debugger_info();
        image
    }

    #[inline]
    pub fn image(&self, id: ImageId) -> &Image {
        &self.graph[id]
    }

    #[inline]
    pub fn image_mut(&mut self, id: ImageId) -> &mut Image {
        &mut self.graph[id]
    }

    #[inline]
    pub fn get(&self, id: ImageId) -> Option<&Image> {
        self.graph.node_weight(id)
    }

    #[inline]
    pub fn contains(&self, id: ImageId) -> bool {
        self.graph.node_weight(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.load_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.load_order.is_empty()
    }

    /// Images in the order they were loaded (inserted libraries precede
    /// the main executable's dependencies).
    pub fn load_order(&self) -> &[ImageId] {
        &self.load_order
    }

    /// The image already loaded from this (device, inode), if any.
    pub fn by_ident(&self, device: u64, inode: u64) -> Option<ImageId> {
        self.by_ident.get(&(device, inode)).copied()
    }

    pub fn by_install_name(&self, name: &str) -> Option<ImageId> {
        self.by_install_name.get(name).copied()
    }

    pub fn by_path(&self, path: &std::path::Path) -> Option<ImageId> {
        self.load_order
            .iter()
            .copied()
            .find(|&id| self.graph[id].path == path)
    }

    /// Lock-free address lookup; safe from signal handlers and the lazy
    /// bind trampoline.
    pub fn image_containing_address(&self, addr: u64) -> Option<ImageId> {
        self.ranges.lookup(addr)
    }

    pub fn add_edge(&mut self, from: ImageId, to: ImageId, edge: DepEdge) {
        // One Dynamic edge per (from, to) pair is enough for reachability.
        if edge == DepEdge::Dynamic
            && self
                .graph
                .edges_connecting(from, to)
                .any(|e| *e.weight() == DepEdge::Dynamic)
        {
            return;
        }
        self.graph.add_edge(from, to, edge);
    }

    /// The images `from` depends on, static edges only, in ordinal order.
    pub fn static_deps(&self, from: ImageId) -> Vec<ImageId> {
        let mut deps: Vec<(u16, ImageId)> = self
            .graph
            .edges(from)
            .filter_map(|e| match e.weight() {
                DepEdge::Static { ordinal, .. } => Some((*ordinal, e.target())),
                DepEdge::Dynamic => None,
            })
            .collect();
        deps.sort_by_key(|&(ordinal, _)| ordinal);
        deps.into_iter().map(|(_, id)| id).collect()
    }

    /// All outgoing reachability edges (static and dynamic).
    pub fn out_neighbors(&self, from: ImageId) -> Vec<ImageId> {
        self.graph
            .neighbors_directed(from, petgraph::Direction::Outgoing)
            .collect()
    }

    /// Incoming static-dependency count, maintained on the image itself;
    /// recompute from the graph for verification.
    pub fn incoming_static_count(&self, to: ImageId) -> usize {
        self.graph
            .edges_directed(to, petgraph::Direction::Incoming)
            .filter(|e| matches!(e.weight(), DepEdge::Static { .. }))
            .count()
    }

    fn republish_debugger_info(&mut self) {
        let records: Vec<DebuggerImageRecord> = self
            .load_order
            .iter()
            .map(|&id| {
                let image = &self.graph[id];
                DebuggerImageRecord {
                    load_address: image.mapping.base_address(),
                    path: image.path.clone(),
                    mod_time: image.mtime,
                }
            })
            .collect();
        let uuids: Vec<([u8; 16], u64)> = self
            .load_order
            .iter()
            .filter_map(|&id| {
                let image = &self.graph[id];
                if image.in_shared_cache() {
                    return None;
                }
                image
                    .uuid
                    .map(|uuid| (uuid, image.mapping.base_address()))
            })
            .collect();
        self.debugger.republish(records, uuids);
    }
}

///////////////////////////////////////////
// Range index
///////////////////////////////////////////

const RANGES_PER_BLOCK: usize = 400;

struct RangeEntry {
    start: AtomicU64,
    end: AtomicU64,
    /// `ImageId` index + 1; 0 marks an empty slot.
    image: AtomicUsize,
}

struct RangeBlock {
    entries: Vec<RangeEntry>,
    next: AtomicPtr<RangeBlock>,
}

impl RangeBlock {
    fn new() -> Box<RangeBlock> {
        let mut entries = Vec::with_capacity(RANGES_PER_BLOCK);
        for _ in 0..RANGES_PER_BLOCK {
            entries.push(RangeEntry {
                start: AtomicU64::new(0),
                end: AtomicU64::new(0),
                image: AtomicUsize::new(0),
            });
        }
        Box::new(RangeBlock {
            entries,
            next: AtomicPtr::new(std::ptr::null_mut()),
        })
    }
}

/// A chained list of fixed-size range arrays. Writers (who already hold
/// the linker lock) publish an entry by writing its bounds first and the
/// image field last with release ordering; readers that observe an empty
/// image field skip the slot, so a torn entry is never returned.
struct RangeIndex {
    head: Box<RangeBlock>,
}

impl RangeIndex {
    fn new() -> Self {
        RangeIndex {
            head: RangeBlock::new(),
        }
    }

    fn insert(&self, start: u64, end: u64, id: ImageId) {
        let encoded = id.index() + 1;
        let mut block: &RangeBlock = &self.head;
        loop {
            for entry in &block.entries {
                if entry.image.load(Ordering::Acquire) == 0 {
                    entry.start.store(start, Ordering::Relaxed);
                    entry.end.store(end, Ordering::Relaxed);
                    // Publish: bounds must be visible before the image.
                    entry.image.store(encoded, Ordering::Release);
                    return;
                }
            }
            let next = block.next.load(Ordering::Acquire);
            if next.is_null() {
                // Chain a new block. Writers are serialized by the linker
                // lock, so a plain store is enough; the leak is deliberate
                // (readers may hold a reference indefinitely).
                let fresh = Box::into_raw(RangeBlock::new());
                block.next.store(fresh, Ordering::Release);
                block = unsafe { &*fresh };
            } else {
                block = unsafe { &*next };
            }
        }
    }

    fn remove_image(&self, id: ImageId) {
        let encoded = id.index() + 1;
        let mut block: Option<&RangeBlock> = Some(&self.head);
        while let Some(current) = block {
            for entry in &current.entries {
                if entry.image.load(Ordering::Acquire) == encoded {
                    entry.image.store(0, Ordering::Release);
                }
            }
            let next = current.next.load(Ordering::Acquire);
            block = if next.is_null() {
                None
            } else {
                Some(unsafe { &*next })
            };
        }
    }

    fn lookup(&self, addr: u64) -> Option<ImageId> {
        let mut block: Option<&RangeBlock> = Some(&self.head);
        while let Some(current) = block {
            for entry in &current.entries {
                let encoded = entry.image.load(Ordering::Acquire);
                if encoded == 0 {
                    continue;
                }
                let start = entry.start.load(Ordering::Relaxed);
                let end = entry.end.load(Ordering::Relaxed);
                if addr >= start && addr < end {
                    return Some(ImageId::new(encoded - 1));
                }
            }
            let next = current.next.load(Ordering::Acquire);
            block = if next.is_null() {
                None
            } else {
                Some(unsafe { &*next })
            };
        }
        None
    }
}

///////////////////////////////////////////
// Debugger-visible projection
///////////////////////////////////////////

/// One row of the image list a debugger snapshots.
#[derive(Debug, Clone)]
pub struct DebuggerImageRecord {
    pub load_address: u64,
    pub path: PathBuf,
    pub mod_time: i64,
}

/// Launch failure details for crash reporting.
#[derive(Debug, Clone)]
pub struct DebuggerErrorInfo {
    pub kind: ErrorKind,
    pub referencing_image: Option<PathBuf>,
    pub target_image: Option<PathBuf>,
    pub symbol: Option<String>,
    pub message: String,
}

/// What happened, for the change notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageListChange {
    Adding,
    Removing,
}

/// The process info a debugger reads from a well-known location: format
/// version, the image list, non-cache UUIDs, shared-cache identity, and
/// error fields. `notifier` is called on every image-list change; its
/// body does nothing; debuggers set a breakpoint on it.
pub struct DebuggerInfo {
    pub version: u32,
    /// Toggled around mutation with the same publish pattern the image
    /// list itself uses; a snapshot taken while false must be retried.
    valid: std::sync::atomic::AtomicBool,
    pub image_records: Vec<DebuggerImageRecord>,
    pub uuids: Vec<([u8; 16], u64)>,
    pub shared_cache_base: u64,
    pub shared_cache_slide: i64,
    pub shared_cache_uuid: [u8; 16],
    pub error: Option<DebuggerErrorInfo>,
    pub notifier: fn(ImageListChange),
}

fn default_notifier(_change: ImageListChange) {
    // Debugger breakpoint site.
}

impl DebuggerInfo {
    fn new() -> Self {
        DebuggerInfo {
            version: 1,
            valid: std::sync::atomic::AtomicBool::new(true),
            image_records: Vec::new(),
            uuids: Vec::new(),
            shared_cache_base: 0,
            shared_cache_slide: 0,
            shared_cache_uuid: [0; 16],
            error: None,
            notifier: default_notifier,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn republish(&mut self, records: Vec<DebuggerImageRecord>, uuids: Vec<([u8; 16], u64)>) {
        let change = if records.len() >= self.image_records.len() {
            ImageListChange::Adding
        } else {
            ImageListChange::Removing
        };
        self.valid.store(false, Ordering::Release);
        self.image_records = records;
        self.uuids = uuids;
        self.valid.store(true, Ordering::Release);
        (self.notifier)(change);
    }

    pub fn record_error(&mut self, info: DebuggerErrorInfo) {
        self.error = Some(info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_index_publish_and_remove() {
        let index = RangeIndex::new();
        let id_a = ImageId::new(7);
        let id_b = ImageId::new(9);
        index.insert(0x1000, 0x3000, id_a);
        index.insert(0x8000, 0x9000, id_b);
        assert_eq!(index.lookup(0x1000), Some(id_a));
        assert_eq!(index.lookup(0x2fff), Some(id_a));
        assert_eq!(index.lookup(0x3000), None);
        assert_eq!(index.lookup(0x8123), Some(id_b));
        index.remove_image(id_a);
        assert_eq!(index.lookup(0x1000), None);
        assert_eq!(index.lookup(0x8123), Some(id_b));
        // The freed slot is reused.
        index.insert(0x500, 0x600, id_b);
        assert_eq!(index.lookup(0x580), Some(id_b));
    }

    #[test]
    fn range_index_chains_blocks() {
        let index = RangeIndex::new();
        for i in 0..RANGES_PER_BLOCK + 10 {
            let base = 0x1000u64 * (i as u64 + 1);
            index.insert(base, base + 0x100, ImageId::new(i));
        }
        let far = 0x1000u64 * (RANGES_PER_BLOCK as u64 + 5);
        assert_eq!(
            index.lookup(far + 0x50),
            Some(ImageId::new(RANGES_PER_BLOCK + 4))
        );
    }
}

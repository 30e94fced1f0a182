//! The orchestrator: process-wide linker state and the machinery that
//! drives the per-image phases across a whole dependency graph.
//!
//! All mutable linker state lives in one [`Linker`] value assembled at
//! boot; image operations see the configuration through the immutable
//! [`LinkContext`] view. Public entry points that run on application
//! threads go through [`LockedLinker`], the global writer lock.

mod coalesce;
mod gc;
mod interpose;
mod link;

pub use interpose::InterposeTuple;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, info, warn};

use crate::cache::SharedCache;
use crate::error::{Error, Result};
use crate::image::{ImageFlags, ImageId, ImageState, OwnExport};
use crate::linkedit::bind::Ordinal;
use crate::mach::cputype::CpuId;
use crate::mach::DepKind;
use crate::paths::SearchConfig;
use crate::registry::{DepEdge, Registry};

/// `DYLD_SHARED_REGION` policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SharedRegionMode {
    #[default]
    Use,
    Private,
    Avoid,
}

/// Configuration captured from the environment at boot. In restricted
/// processes every variable is silently ignored.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub search: SearchConfig,
    pub insert_libraries: Vec<PathBuf>,
    pub bind_at_launch: bool,
    pub force_flat_namespace: bool,
    pub shared_region: SharedRegionMode,
    pub disable_prefetch: bool,
    pub disable_dofs: bool,
    print: HashSet<String>,
}

impl EnvConfig {
    /// Parse `key=value` pairs. `restricted` processes get defaults no
    /// matter what the environment says.
    pub fn from_env<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
        restricted: bool,
    ) -> EnvConfig {
        let mut config = EnvConfig::default();
        if restricted {
            config.search.restricted = true;
            return config;
        }
        let paths = |value: &str| -> Vec<PathBuf> {
            value
                .split(':')
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect()
        };
        for (key, value) in pairs {
            match key {
                "DYLD_FRAMEWORK_PATH" => config.search.framework_paths = paths(value),
                "DYLD_FALLBACK_FRAMEWORK_PATH" => {
                    config.search.fallback_framework_paths = paths(value)
                }
                "DYLD_LIBRARY_PATH" => config.search.library_paths = paths(value),
                "DYLD_FALLBACK_LIBRARY_PATH" => config.search.fallback_library_paths = paths(value),
                "DYLD_VERSIONED_LIBRARY_PATH" => {
                    config.search.versioned_library_paths = paths(value)
                }
                "DYLD_VERSIONED_FRAMEWORK_PATH" => {
                    config.search.versioned_framework_paths = paths(value)
                }
                "DYLD_ROOT_PATH" => config.search.root_paths = paths(value),
                "DYLD_IMAGE_SUFFIX" => config.search.image_suffix = Some(value.to_string()),
                "DYLD_INSERT_LIBRARIES" => config.insert_libraries = paths(value),
                "DYLD_BIND_AT_LAUNCH" => config.bind_at_launch = true,
                "DYLD_FORCE_FLAT_NAMESPACE" => config.force_flat_namespace = true,
                "DYLD_SHARED_REGION" => {
                    config.shared_region = match value {
                        "private" => SharedRegionMode::Private,
                        "avoid" => SharedRegionMode::Avoid,
                        _ => SharedRegionMode::Use,
                    }
                }
                "DYLD_DISABLE_PREFETCH" => config.disable_prefetch = true,
                "DYLD_DISABLE_DOFS" => config.disable_dofs = true,
                _ => {
                    if let Some(what) = key.strip_prefix("DYLD_PRINT_") {
                        config.print.insert(what.to_ascii_lowercase());
                    }
                }
            }
        }
        config
    }

    /// Was `DYLD_PRINT_<WHAT>` set?
    pub fn prints(&self, what: &str) -> bool {
        self.print.contains(what)
    }
}

/// The `(argc, argv, envp, apple, program-vars)` tuple initializers are
/// entitled to.
#[derive(Debug, Default, Clone)]
pub struct ProgramVars {
    pub argv: Vec<String>,
    pub envp: Vec<String>,
    pub apple: Vec<String>,
}

/// How initializer/terminator entry points are invoked. The native
/// runner jumps to the address; tests substitute a recorder.
pub type InitializerRunner = Box<dyn Fn(u64, &ProgramVars) + Send>;

/// Jump to a `S_MOD_INIT_FUNC_POINTERS` style entry with the standard
/// argument tuple.
pub fn native_initializer_runner() -> InitializerRunner {
    Box::new(|address, vars| {
        type Initializer = extern "C" fn(libc::c_int, *const *const libc::c_char);
        let argv: Vec<std::ffi::CString> = vars
            .argv
            .iter()
            .filter_map(|a| std::ffi::CString::new(a.as_str()).ok())
            .collect();
        let mut argv_ptrs: Vec<*const libc::c_char> =
            argv.iter().map(|a| a.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());
        // SAFETY: the address came out of a mapped, initialized image's
        // initializer section.
        let entry: Initializer = unsafe { std::mem::transmute(address as usize) };
        entry(vars.argv.len() as libc::c_int, argv_ptrs.as_ptr());
    })
}

/// A state-change handler: sees each batch of images reaching `state`
/// (sorted dependents-first) and may reject the load by returning a
/// string, honored only for `DependentsMapped`.
pub type StateHandler = Box<dyn FnMut(ImageState, &[BatchImage]) -> Option<String> + Send>;

/// One row of a notification batch.
#[derive(Debug, Clone)]
pub struct BatchImage {
    pub id: ImageId,
    pub path: PathBuf,
    pub load_address: u64,
    pub depth: u32,
}

/// The immutable configuration view passed down to image operations.
pub struct LinkContext {
    pub env: EnvConfig,
    pub restricted: bool,
    /// Seed from the kernel (`stack_guard=`), mixed for pad and cache
    /// slide decisions.
    pub entropy: u64,
    pub host: CpuId,
    pub vars: ProgramVars,
    pub initializer_runner: InitializerRunner,
    /// Invoked over each executable range of a dying image so the C++
    /// runtime can run its per-range finalizers before unmap.
    pub range_finalizer: Option<Box<dyn Fn(u64, u64) + Send>>,
    /// Kernel code-signature registration surrogate: given the file path,
    /// accept or reject the image. `None` accepts everything (unsigned
    /// hosts).
    pub signature_validator: Option<Box<dyn Fn(&std::path::Path) -> bool + Send>>,
}

impl LinkContext {
    pub fn new(host: CpuId) -> LinkContext {
        LinkContext {
            env: EnvConfig::default(),
            restricted: false,
            entropy: 0,
            host,
            vars: ProgramVars::default(),
            initializer_runner: native_initializer_runner(),
            range_finalizer: None,
            signature_validator: None,
        }
    }

    /// Next pseudo-random value derived from the boot entropy; xorshift
    /// keeps consecutive images from landing at guessable gaps without
    /// pulling in an RNG.
    pub fn next_entropy(&self, salt: u64) -> u64 {
        let mut x = self.entropy ^ salt.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        x
    }
}

/// Counters logged at launch end under `DYLD_PRINT_STATISTICS`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub images_loaded: usize,
    pub rebase_fixups: usize,
    pub bind_fixups: usize,
    pub lazy_binds: usize,
    pub weak_symbols_coalesced: usize,
}

/// The process-wide linker state.
pub struct Linker {
    pub ctx: LinkContext,
    pub registry: Registry,
    pub cache: Option<SharedCache>,
    pub(crate) interposers: Vec<InterposeTuple>,
    /// Images in the order they finished initialization; terminators run
    /// in reverse of this.
    pub(crate) init_order: Vec<ImageId>,
    pub(crate) handlers: Vec<(ImageState, StateHandler)>,
    pub(crate) dof_registrations: Vec<(ImageId, u64, u64)>,
    pub stats: Stats,
    pub(crate) main_image: Option<ImageId>,
    pub(crate) inserted: Vec<ImageId>,
    pub(crate) gc_in_progress: bool,
    pub(crate) gc_redo: bool,
    /// "What were we doing" note included in halt messages.
    pub(crate) phase_note: String,
}

impl Linker {
    pub fn new(ctx: LinkContext) -> Linker {
        Linker {
            ctx,
            registry: Registry::new(),
            cache: None,
            interposers: Vec::new(),
            init_order: Vec::new(),
            handlers: Vec::new(),
            dof_registrations: Vec::new(),
            stats: Stats::default(),
            main_image: None,
            inserted: Vec::new(),
            gc_in_progress: false,
            gc_redo: false,
            phase_note: String::new(),
        }
    }

    pub fn main_image(&self) -> Option<ImageId> {
        self.main_image
    }

    /// Declare the registered image the process's main executable: the
    /// root of launch linking and of flat-lookup ordering.
    pub fn set_main_image(&mut self, id: ImageId) {
        self.main_image = Some(id);
    }

    pub fn inserted_images(&self) -> &[ImageId] {
        &self.inserted
    }

    /// Record an image loaded via the insert-libraries control; inserted
    /// images precede the main executable in flat lookups and are the
    /// only images whose `__interpose` sections are honored.
    pub fn add_inserted(&mut self, id: ImageId) {
        if !self.inserted.contains(&id) {
            self.inserted.push(id);
        }
    }

    pub(crate) fn note_phase(&mut self, note: &str) {
        self.phase_note.clear();
        self.phase_note.push_str(note);
    }

    /// The running "what were we doing" note, folded into halt messages.
    pub fn phase_note(&self) -> &str {
        &self.phase_note
    }

    /// Register a handler. Per the contract, a handler installed for an
    /// already-reached state immediately observes every image at or past
    /// that state (its return value cannot abort anything at this point).
    pub fn register_state_handler(&mut self, state: ImageState, mut handler: StateHandler) {
        let batch: Vec<BatchImage> = self
            .registry
            .load_order()
            .iter()
            .copied()
            .filter(|&id| self.registry.image(id).state >= state)
            .map(|id| self.batch_image(id))
            .collect();
        if !batch.is_empty() {
            let _ = handler(state, &batch);
        }
        self.handlers.push((state, handler));
    }

    pub(crate) fn batch_image(&self, id: ImageId) -> BatchImage {
        let image = self.registry.image(id);
        BatchImage {
            id,
            path: image.path.clone(),
            load_address: image.mapping.base_address(),
            depth: image.depth,
        }
    }

    /// Deliver a batch notification, dependents (deepest) first. The
    /// returned rejection is meaningful only for `DependentsMapped`.
    pub(crate) fn notify_batch(&mut self, state: ImageState, ids: &[ImageId]) -> Option<String> {
        if self.handlers.is_empty() || ids.is_empty() {
            return None;
        }
        let mut batch: Vec<BatchImage> = ids.iter().map(|&id| self.batch_image(id)).collect();
        batch.sort_by(|a, b| b.depth.cmp(&a.depth));
        let mut rejection = None;
        // Handlers may call back into registration, so take the list out
        // while iterating.
        let mut handlers = std::mem::take(&mut self.handlers);
        for (handler_state, handler) in handlers.iter_mut() {
            if *handler_state == state {
                if let Some(reason) = handler(state, &batch) {
                    rejection.get_or_insert(reason);
                }
            }
        }
        self.handlers = handlers;
        rejection
    }

    ///////////////////////////////////////////
    // Symbol resolution protocol
    ///////////////////////////////////////////

    /// Search one image's exports, chasing re-exported dependencies.
    pub fn search_exports(
        &self,
        id: ImageId,
        name: &str,
        visited: &mut HashSet<ImageId>,
    ) -> Result<Option<ResolvedSymbol>> {
        if !visited.insert(id) {
            return Ok(None);
        }
        let image = self.registry.image(id);
        match image.find_own_export(name)? {
            Some(OwnExport::Definition { address, weak }) => {
                return Ok(Some(ResolvedSymbol {
                    address,
                    defined_in: Some(id),
                    weak,
                }));
            }
            Some(OwnExport::Reexport { ordinal, name: alias }) => {
                let target_name = alias.as_deref().unwrap_or(name);
                let dep = (ordinal as usize)
                    .checked_sub(1)
                    .and_then(|i| image.deps.get(i))
                    .and_then(|d| d.image);
                if let Some(dep) = dep {
                    return self.search_exports(dep, target_name, visited);
                }
                return Ok(None);
            }
            None => {}
        }
        // Not exported directly; search re-exported dependencies (the
        // umbrella pattern).
        for dep in &image.deps {
            if dep.kind == DepKind::Reexport {
                if let Some(dep_id) = dep.image {
                    if let Some(found) = self.search_exports(dep_id, name, visited)? {
                        return Ok(Some(found));
                    }
                }
            }
        }
        Ok(None)
    }

    /// The registry order flat lookups use: inserted libraries first,
    /// then the main image, then everything else in load order.
    pub(crate) fn flat_search_order(&self) -> Vec<ImageId> {
        let mut order: Vec<ImageId> = self.inserted.clone();
        if let Some(main) = self.main_image {
            if !order.contains(&main) {
                order.push(main);
            }
        }
        for &id in self.registry.load_order() {
            if !order.contains(&id) {
                order.push(id);
            }
        }
        order
    }

    /// Flat-namespace lookup: walk every image; among matches prefer
    /// non-weak, then first found.
    pub fn flat_lookup(&self, name: &str) -> Result<Option<ResolvedSymbol>> {
        let mut first_weak: Option<ResolvedSymbol> = None;
        for id in self.flat_search_order() {
            let image = self.registry.image(id);
            if image.flags.contains(ImageFlags::HIDE_EXPORTS) {
                continue;
            }
            let mut visited = HashSet::new();
            if let Some(found) = self.search_exports(id, name, &mut visited)? {
                if !found.weak {
                    return Ok(Some(found));
                }
                first_weak.get_or_insert(found);
            }
        }
        Ok(first_weak)
    }

    /// The full resolution protocol for one bind request.
    pub fn resolve_ordinal(
        &self,
        referencing: ImageId,
        ordinal: Ordinal,
        symbol: &str,
        weak_import: bool,
    ) -> Result<Option<ResolvedSymbol>> {
        let resolved = if self.ctx.env.force_flat_namespace {
            self.flat_lookup(symbol)?
        } else {
            match ordinal {
                Ordinal::SelfImage => {
                    let mut visited = HashSet::new();
                    self.search_exports(referencing, symbol, &mut visited)?
                }
                Ordinal::MainExecutable => match self.main_image {
                    Some(main) => {
                        let mut visited = HashSet::new();
                        self.search_exports(main, symbol, &mut visited)?
                    }
                    None => None,
                },
                Ordinal::FlatLookup => self.flat_lookup(symbol)?,
                Ordinal::Library(n) => {
                    let image = self.registry.image(referencing);
                    let dep = image.deps.get(n as usize - 1).ok_or_else(|| {
                        Error::MalformedImage {
                            path: image.path.clone(),
                            reason: format!("bind ordinal {} exceeds dependency table", n),
                        }
                    })?;
                    match dep.image {
                        Some(dep_id) => {
                            let mut visited = HashSet::new();
                            self.search_exports(dep_id, symbol, &mut visited)?
                        }
                        // Missing weak dependency: every symbol expected
                        // in it resolves to zero, weak-import or not.
                        None if dep.kind == DepKind::Weak => return Ok(None),
                        None => None,
                    }
                }
            }
        };
        match resolved {
            Some(found) => Ok(Some(found)),
            None if weak_import => Ok(None),
            None => {
                let image = self.registry.image(referencing);
                let expected_in = match ordinal {
                    Ordinal::Library(n) => image
                        .deps
                        .get(n as usize - 1)
                        .map(|d| d.name.clone())
                        .unwrap_or_else(|| "?".into()),
                    Ordinal::SelfImage => image.identity_name().to_string(),
                    Ordinal::MainExecutable => "main executable".into(),
                    Ordinal::FlatLookup => "flat namespace".into(),
                };
                Err(Error::SymbolNotFound {
                    symbol: symbol.to_string(),
                    referenced_from: image.path.clone(),
                    expected_in,
                })
            }
        }
    }

    /// Record that `from` now depends on `to` dynamically (flat or
    /// coalesced lookup outside the static dependency table).
    pub(crate) fn record_dynamic_reference(&mut self, from: ImageId, to: ImageId) {
        if from == to {
            return;
        }
        if self.registry.image(to).in_shared_cache() {
            return;
        }
        let is_static = self
            .registry
            .image(from)
            .deps
            .iter()
            .any(|d| d.image == Some(to));
        if is_static {
            return;
        }
        self.registry.add_edge(from, to, DepEdge::Dynamic);
        self.registry.image_mut(to).dynamic_ref_count += 1;
        debug!(
            target: "libraries",
            "dynamic reference {:?} -> {:?}",
            self.registry.image(from).path,
            self.registry.image(to).path
        );
    }

    ///////////////////////////////////////////
    // Public operations (dlopen/dlsym/dladdr cores)
    ///////////////////////////////////////////

    /// The core of `dlsym`: find `name` in `image` (two-level, with
    /// re-exports) and return its address after interposition.
    pub fn symbol_address(&self, image: ImageId, name: &str) -> Result<Option<u64>> {
        let mut visited = HashSet::new();
        Ok(self
            .search_exports(image, name, &mut visited)?
            .map(|found| self.interposed_address(found.address, Some(image))))
    }

    /// The core of `dladdr`.
    pub fn image_containing_address(&self, addr: u64) -> Option<ImageId> {
        self.registry.image_containing_address(addr)
    }

    /// Run every registered terminator, in reverse of initialization
    /// completion order. Called at process exit.
    pub fn run_all_terminators(&mut self) {
        let order: Vec<ImageId> = self.init_order.iter().rev().copied().collect();
        for id in order {
            if self.registry.contains(id) {
                self.run_terminators_for(id);
            }
        }
    }

    pub(crate) fn run_terminators_for(&mut self, id: ImageId) {
        let terminators = {
            let image = self.registry.image_mut(id);
            if image.state != ImageState::Initialized {
                return;
            }
            image.set_state(ImageState::Terminated);
            image.terminators()
        };
        let path = self.registry.image(id).path.clone();
        for terminator in terminators {
            info!(target: "initializers", "running terminator {:#x} for {:?}", terminator, path);
            (self.ctx.initializer_runner)(terminator, &self.ctx.vars);
        }
    }

    /// Log the launch statistics (`DYLD_PRINT_STATISTICS`).
    pub fn log_statistics(&self) {
        if self.ctx.env.prints("statistics") {
            info!(
                target: "statistics",
                "images loaded: {}  rebases: {}  binds: {}  lazy binds: {}  weak symbols: {}",
                self.stats.images_loaded,
                self.stats.rebase_fixups,
                self.stats.bind_fixups,
                self.stats.lazy_binds,
                self.stats.weak_symbols_coalesced,
            );
        }
    }

    pub(crate) fn warn(&self, message: &str) {
        warn!(target: "warnings", "{}", message);
    }

    /// Find an already-registered image for `path`, matching the way the
    /// loader would: by path, then by (device, inode).
    pub fn find_loaded(&self, path: &Path) -> Option<ImageId> {
        if let Some(id) = self.registry.by_path(path) {
            return Some(id);
        }
        use std::os::unix::fs::MetadataExt;
        let meta = std::fs::metadata(path).ok()?;
        self.registry.by_ident(meta.dev(), meta.ino())
    }
}

/// A symbol resolution result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedSymbol {
    pub address: u64,
    pub defined_in: Option<ImageId>,
    pub weak: bool,
}

/// The global writer lock around the linker: every public entry point
/// that mutates registry or image state goes through here. The range
/// index stays readable without it.
pub struct LockedLinker {
    inner: Mutex<Linker>,
}

impl LockedLinker {
    pub fn new(linker: Linker) -> LockedLinker {
        LockedLinker {
            inner: Mutex::new(linker),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Linker) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn into_inner(self) -> Linker {
        self.inner.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

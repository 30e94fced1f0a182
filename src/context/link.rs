//! The link sequence: recursive library loading, depth assignment,
//! rebase, bind, notifications, initializers, and runtime open/close.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::error::{Error, Result};
use crate::image::{Image, ImageFlags, ImageId, ImageState, LoadOptions, MAX_DEPTH};
use crate::linkedit::bind::Ordinal;
use crate::mach::DepKind;
use crate::paths::{self, RPathChain, ResolveRequest};
use crate::registry::DepEdge;

use super::Linker;

/// One fully-specified bind request, decoupled from the stream borrows.
struct PendingBind {
    address: u64,
    kind: u8,
    ordinal: Ordinal,
    symbol: String,
    addend: i64,
    weak_import: bool,
}

/// What one `link` call changed, for unwinding a failed runtime load.
#[derive(Default)]
pub(crate) struct LinkJournal {
    pub newly_loaded: Vec<ImageId>,
}

impl Linker {
    /// The fixed link sequence over a set of roots:
    ///
    /// ```text
    /// recursive-load-libraries   → notify(dependents-mapped)
    /// clear-depths ; recursive-update-depth
    /// recursive-rebase           → notify(rebased)
    /// recursive-bind             → notify(bound)
    /// register-interposing       (inserted roots, once all are bound)
    /// apply-interposing          (per newly-bound image)
    /// weak-coalesce              (whole process, after interposing)
    /// register-dof
    /// ```
    pub fn link_roots(&mut self, roots: &[ImageId], force_lazy: bool) -> Result<()> {
        let mut journal = LinkJournal::default();
        match self.link_roots_inner(roots, force_lazy, &mut journal) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.unwind(journal);
                Err(err)
            }
        }
    }

    fn link_roots_inner(
        &mut self,
        roots: &[ImageId],
        force_lazy: bool,
        journal: &mut LinkJournal,
    ) -> Result<()> {
        // Phase 1: map the whole dependency graph.
        self.note_phase("loading libraries");
        let mut mapped = Vec::new();
        for &root in roots {
            self.recursive_load_libraries(root, &[], journal, &mut mapped)?;
        }
        if let Some(reason) = self.notify_batch(ImageState::DependentsMapped, &mapped) {
            return Err(Error::HandlerRejected { reason });
        }

        // Depths: cleared then assigned bottom-up, cycle-tolerant.
        self.clear_depths();
        for &root in roots {
            self.recursive_update_depth(root);
        }

        // Phase 2: rebase.
        self.note_phase("rebasing images");
        let mut rebased = Vec::new();
        for &root in roots {
            self.recursive_rebase(root, &mut rebased)?;
        }
        self.notify_batch(ImageState::Rebased, &rebased);

        // Phase 3: bind.
        self.note_phase("binding images");
        let mut bound = Vec::new();
        for &root in roots {
            self.recursive_bind(root, force_lazy, &mut bound)?;
        }
        self.notify_batch(ImageState::Bound, &bound);

        // Phase 4: interposition first, then weak coalescing. Only
        // inserted libraries can interpose, and registration waits until
        // every one of them is bound so tuple chaining sees final pointer
        // values. Weak binding runs only after the tuples exist, so
        // coalesced pointers resolve through them.
        self.note_phase("applying interposing");
        let newly_inserted: Vec<ImageId> = self
            .inserted
            .clone()
            .into_iter()
            .filter(|id| bound.contains(id))
            .collect();
        for id in newly_inserted {
            self.register_interposing(id);
        }
        for &id in &bound {
            self.apply_interposing_to_image(id)?;
        }
        self.note_phase("coalescing weak symbols");
        self.weak_coalesce()?;
        self.register_dofs(&mapped);
        Ok(())
    }

    /// Roll back a failed runtime load: newly created images are removed
    /// and reference counts on their surviving dependencies dropped.
    fn unwind(&mut self, journal: LinkJournal) {
        for &id in journal.newly_loaded.iter().rev() {
            if !self.registry.contains(id) {
                continue;
            }
            let deps: Vec<ImageId> = self
                .registry
                .image(id)
                .deps
                .iter()
                .filter_map(|d| d.image)
                .collect();
            for dep in deps {
                if self.registry.contains(dep) {
                    let image = self.registry.image_mut(dep);
                    image.static_ref_count = image.static_ref_count.saturating_sub(1);
                }
            }
            debug!(target: "libraries", "unwinding failed load of {:?}", self.registry.image(id).path);
            self.registry.remove(id);
        }
        self.inserted.retain(|id| self.registry.contains(*id));
    }

    ///////////////////////////////////////////
    // Phase 1: recursive-load-libraries
    ///////////////////////////////////////////

    /// This image's rpath entries, `@loader_path`/`@executable_path`
    /// already expanded against its location.
    fn expanded_rpaths(&self, id: ImageId) -> Vec<String> {
        let image = self.registry.image(id);
        let loader_dir = image.path.parent();
        let executable_dir = self
            .main_image
            .and_then(|main| self.registry.get(main))
            .and_then(|main| main.path.parent());
        image
            .rpaths
            .iter()
            .filter_map(|rpath| {
                if let Some(rest) = rpath.strip_prefix("@loader_path/") {
                    loader_dir.map(|dir| dir.join(rest).to_string_lossy().into_owned())
                } else if let Some(rest) = rpath.strip_prefix("@executable_path/") {
                    executable_dir.map(|dir| dir.join(rest).to_string_lossy().into_owned())
                } else {
                    Some(rpath.clone())
                }
            })
            .collect()
    }

    fn recursive_load_libraries(
        &mut self,
        id: ImageId,
        inherited_rpaths: &[String],
        journal: &mut LinkJournal,
        mapped: &mut Vec<ImageId>,
    ) -> Result<()> {
        // Cycle break: an image re-entered during its own load just
        // returns.
        if self.registry.image(id).state >= ImageState::DependentsMapped {
            return Ok(());
        }
        self.registry
            .image_mut(id)
            .set_state(ImageState::DependentsMapped);

        // The rpath chain seen by this image's loads: its own entries
        // first, then everything inherited from its loaders.
        let mut chain = self.expanded_rpaths(id);
        chain.extend(inherited_rpaths.iter().cloned());

        let dep_count = self.registry.image(id).deps.len();
        for index in 0..dep_count {
            let (name, kind, required_compat) = {
                let dep = &self.registry.image(id).deps[index];
                (dep.name.clone(), dep.kind, dep.compat_version)
            };
            let loaded = self.load_dependency(id, &name, &chain, journal);
            match loaded {
                Ok(dep_id) => {
                    let actual_compat = self.registry.image(dep_id).compat_version;
                    if actual_compat < required_compat {
                        let image = self.registry.image(id);
                        return Err(Error::VersionMismatch {
                            name: name.clone(),
                            referenced_from: image.path.clone(),
                            required: required_compat,
                            found: actual_compat,
                        });
                    }
                    self.registry.image_mut(id).deps[index].image = Some(dep_id);
                    self.registry.image_mut(dep_id).static_ref_count += 1;
                    self.registry.add_edge(
                        id,
                        dep_id,
                        DepEdge::Static {
                            ordinal: (index + 1) as u16,
                            upward: kind == DepKind::Upward,
                        },
                    );
                    self.recursive_load_libraries(dep_id, &chain, journal, mapped)?;
                }
                Err(_) if kind == DepKind::Weak => {
                    // A weak dependency that fails to resolve leaves a
                    // null slot.
                    debug!(target: "libraries", "weak library {} not found, leaving null", name);
                }
                Err(err) => return Err(err),
            }
        }
        mapped.push(id);
        Ok(())
    }

    fn load_dependency(
        &mut self,
        loader: ImageId,
        name: &str,
        rpath_chain: &[String],
        journal: &mut LinkJournal,
    ) -> Result<ImageId> {
        let (loader_path, loader_is_main) = {
            let image = self.registry.image(loader);
            (image.path.clone(), Some(loader) == self.main_image)
        };
        let executable_dir: Option<PathBuf> = self
            .main_image
            .and_then(|main| self.registry.get(main))
            .and_then(|main| main.path.parent().map(Path::to_path_buf));
        let request = ResolveRequest {
            requested: name,
            executable_dir: executable_dir.as_deref(),
            loader_dir: loader_path.parent(),
            loader_is_main,
            rpaths: RPathChain::new(None, rpath_chain),
        };
        match self.load_by_request(&request, ImageFlags::empty(), journal) {
            Ok(id) => Ok(id),
            Err(Error::MissingLibrary { name, reason, .. }) => Err(Error::MissingLibrary {
                name,
                referenced_from: loader_path,
                reason,
            }),
            Err(other) => Err(other),
        }
    }

    /// Resolve one requested name to an image: already-loaded, shared
    /// cache, or mapped fresh from disk.
    pub(crate) fn load_by_request(
        &mut self,
        request: &ResolveRequest<'_>,
        extra_flags: ImageFlags,
        journal: &mut LinkJournal,
    ) -> Result<ImageId> {
        let candidates = paths::candidates(request, &self.ctx.env.search);
        let mut tried = Vec::new();
        for candidate in &candidates {
            if let Some(id) = self.registry.by_path(candidate) {
                return Ok(id);
            }
            match std::fs::metadata(candidate) {
                Ok(meta) if meta.is_file() => {
                    return self.load_mapped_file(candidate, &meta, extra_flags, journal);
                }
                _ => {
                    // The file may still live (only) in the shared cache.
                    if let Some(id) = self.load_from_cache_path(candidate, extra_flags, journal)? {
                        return Ok(id);
                    }
                    tried.push(candidate.display().to_string());
                }
            }
        }
        // Install-name match against something already loaded (a dylib
        // loaded under a different physical path).
        if let Some(id) = self.registry.by_install_name(request.requested) {
            return Ok(id);
        }
        Err(Error::MissingLibrary {
            name: request.requested.to_string(),
            referenced_from: PathBuf::new(),
            reason: format!("tried: {}", tried.join(", ")),
        })
    }

    fn load_mapped_file(
        &mut self,
        path: &Path,
        meta: &std::fs::Metadata,
        extra_flags: ImageFlags,
        journal: &mut LinkJournal,
    ) -> Result<ImageId> {
        use std::os::unix::fs::MetadataExt;
        // The same file under another name is the same image.
        if let Some(id) = self.registry.by_ident(meta.dev(), meta.ino()) {
            return Ok(id);
        }
        // A disk file shadowing a cache image marks the cache overridden.
        let mut flags = extra_flags;
        let cached_ident = self
            .cache
            .as_ref()
            .and_then(|cache| cache.image_by_path(path))
            .map(|cached| (cached.inode, cached.mtime));
        if let Some((inode, mtime)) = cached_ident {
            if inode == meta.ino() && mtime == meta.mtime() {
                return self.materialize_cache_image(path, extra_flags, journal);
            }
            flags |= ImageFlags::CACHE_OVERRIDE;
            self.warn(&format!(
                "overriding shared cache image with on-disk {:?}",
                path
            ));
        }
        // Code-signature registration happens before the image becomes
        // visible; a rejection is a hard load failure.
        if let Some(validator) = &self.ctx.signature_validator {
            if !validator(path) {
                return Err(Error::SignatureInvalid {
                    path: path.to_path_buf(),
                });
            }
        }
        let file = File::open(path)?;
        let opts = LoadOptions {
            host: self.ctx.host,
            entropy: self.ctx.next_entropy(self.registry.len() as u64 + 1),
            flags,
        };
        let image = Image::load_from_file(path, &file, meta, &opts)?;
        // The descriptor closes here, before the image is published.
        drop(file);
        // Versioned override: a copy in a configured override directory
        // with the same install name and a newer current version
        // substitutes for the one just mapped.
        if let Some(install_name) = image.install_name.clone() {
            if let Some(better) = paths::versioned_override(
                &self.ctx.env.search,
                self.ctx.host,
                &install_name,
                image.current_version,
            ) {
                if better != path {
                    drop(image);
                    let file = File::open(&better)?;
                    let meta = file.metadata()?;
                    let opts = LoadOptions {
                        host: self.ctx.host,
                        entropy: self.ctx.next_entropy(self.registry.len() as u64 + 2),
                        flags,
                    };
                    let image = Image::load_from_file(&better, &file, &meta, &opts)?;
                    drop(file);
                    return Ok(self.publish_image(image, journal));
                }
            }
        }
        Ok(self.publish_image(image, journal))
    }

    fn load_from_cache_path(
        &mut self,
        path: &Path,
        extra_flags: ImageFlags,
        journal: &mut LinkJournal,
    ) -> Result<Option<ImageId>> {
        if self.cache.as_ref().and_then(|c| c.image_by_path(path)).is_none() {
            return Ok(None);
        }
        self.materialize_cache_image(path, extra_flags, journal)
            .map(Some)
    }

    fn materialize_cache_image(
        &mut self,
        path: &Path,
        extra_flags: ImageFlags,
        journal: &mut LinkJournal,
    ) -> Result<ImageId> {
        let cache = self.cache.as_ref().expect("cache checked by caller");
        let opts = LoadOptions {
            host: self.ctx.host,
            entropy: 0,
            flags: extra_flags,
        };
        let image = cache.instantiate_image(path, &opts)?;
        Ok(self.publish_image(image, journal))
    }

    pub(crate) fn publish_image(&mut self, image: Image, journal: &mut LinkJournal) -> ImageId {
        let path = image.path.clone();
        let id = self.registry.add(image);
        journal.newly_loaded.push(id);
        self.stats.images_loaded += 1;
        if self.ctx.env.prints("libraries") {
            info!(target: "libraries", "loaded {:?}", path);
        }
        id
    }

    ///////////////////////////////////////////
    // Depth assignment
    ///////////////////////////////////////////

    pub(crate) fn clear_depths(&mut self) {
        let ids: Vec<ImageId> = self.registry.load_order().to_vec();
        for id in ids {
            self.registry.image_mut(id).depth = 0;
        }
    }

    /// Cycle-tolerant bottom-up depth assignment: first entry pins the
    /// image at `MAX_DEPTH`, then the recursion settles it to
    /// `min(dependency depths) - 1`.
    pub(crate) fn recursive_update_depth(&mut self, id: ImageId) -> u32 {
        if self.registry.image(id).depth != 0 {
            return self.registry.image(id).depth;
        }
        self.registry.image_mut(id).depth = MAX_DEPTH;
        let mut minimum = MAX_DEPTH;
        let deps = self.registry.static_deps(id);
        for dep in deps {
            minimum = minimum.min(self.recursive_update_depth(dep));
        }
        let depth = if minimum == MAX_DEPTH {
            MAX_DEPTH
        } else {
            minimum - 1
        };
        let depth = depth.max(1);
        self.registry.image_mut(id).depth = depth;
        depth
    }

    ///////////////////////////////////////////
    // Phase 2: recursive-rebase
    ///////////////////////////////////////////

    fn recursive_rebase(&mut self, id: ImageId, rebased: &mut Vec<ImageId>) -> Result<()> {
        if self.registry.image(id).state >= ImageState::Rebased {
            return Ok(());
        }
        // Mark before recursing so a cycle re-entry returns.
        self.registry.image_mut(id).set_state(ImageState::Rebased);
        for dep in self.registry.static_deps(id) {
            if let Err(err) = self.recursive_rebase(dep, rebased) {
                self.registry
                    .image_mut(id)
                    .rollback_state(ImageState::DependentsMapped);
                return Err(err);
            }
        }
        let image = self.registry.image_mut(id);
        match image.apply_rebase() {
            Ok(()) => {
                rebased.push(id);
                Ok(())
            }
            Err(err) => {
                image.rollback_state(ImageState::DependentsMapped);
                Err(err)
            }
        }
    }

    ///////////////////////////////////////////
    // Phase 3: recursive-bind
    ///////////////////////////////////////////

    fn recursive_bind(
        &mut self,
        id: ImageId,
        force_lazy: bool,
        bound: &mut Vec<ImageId>,
    ) -> Result<()> {
        if self.registry.image(id).state >= ImageState::Bound {
            return Ok(());
        }
        self.registry.image_mut(id).set_state(ImageState::Bound);
        for dep in self.registry.static_deps(id) {
            if let Err(err) = self.recursive_bind(dep, force_lazy, bound) {
                self.registry
                    .image_mut(id)
                    .rollback_state(ImageState::Rebased);
                return Err(err);
            }
        }
        match self.bind_image(id, force_lazy) {
            Ok(()) => {
                bound.push(id);
                Ok(())
            }
            Err(err) => {
                self.registry
                    .image_mut(id)
                    .rollback_state(ImageState::Rebased);
                Err(err)
            }
        }
    }

    fn bind_image(&mut self, id: ImageId, force_lazy: bool) -> Result<()> {
        let force_lazy = force_lazy || self.ctx.env.bind_at_launch;
        let pending = self.collect_binds(id, force_lazy)?;
        let count = pending.len();
        for bind in pending {
            let resolved =
                self.resolve_ordinal(id, bind.ordinal, &bind.symbol, bind.weak_import)?;
            let (value, defined_in) = match resolved {
                Some(found) => {
                    let interposed = self.interposed_address(found.address, Some(id));
                    (
                        (interposed as i64).wrapping_add(bind.addend) as u64,
                        found.defined_in,
                    )
                }
                // Weak imports that fail resolve to zero.
                None => (0, None),
            };
            if self.ctx.env.prints("bindings") {
                info!(
                    target: "bindings",
                    "bind {:?}: *{:#x} = {:#x} ({})",
                    self.registry.image(id).path,
                    bind.address,
                    value,
                    bind.symbol
                );
            } else {
                debug!(
                    target: "bindings",
                    "bind *{:#x} = {:#x} ({})", bind.address, value, bind.symbol
                );
            }
            self.registry
                .image_mut(id)
                .write_bind(bind.address, value, bind.kind)?;
            if matches!(bind.ordinal, Ordinal::FlatLookup) {
                if let Some(to) = defined_in {
                    self.record_dynamic_reference(id, to);
                }
            }
        }
        self.registry.image_mut(id).finish_fixups()?;
        self.stats.bind_fixups += count;
        Ok(())
    }

    fn collect_binds(&self, id: ImageId, include_lazy: bool) -> Result<Vec<PendingBind>> {
        let image = self.registry.image(id);
        let mut pending = Vec::new();
        for record in image.bind_records()? {
            pending.push(PendingBind {
                address: record.address,
                kind: record.kind,
                ordinal: record.ordinal,
                symbol: record.symbol.to_string(),
                addend: record.addend,
                weak_import: record.weak_import,
            });
        }
        if include_lazy {
            for (_, record) in image.lazy_bind_records()? {
                pending.push(PendingBind {
                    address: record.address,
                    kind: record.kind,
                    ordinal: record.ordinal,
                    symbol: record.symbol.to_string(),
                    addend: record.addend,
                    weak_import: record.weak_import,
                });
            }
        }
        for classic in image.classic_bind_records()? {
            pending.push(PendingBind {
                address: classic.address,
                kind: crate::linkedit::bind::BIND_TYPE_POINTER,
                ordinal: classic.ordinal,
                symbol: classic.symbol,
                addend: 0,
                weak_import: classic.weak_import,
            });
        }
        Ok(pending)
    }

    ///////////////////////////////////////////
    // Initializers
    ///////////////////////////////////////////

    /// Run initializers bottom-up over `root`'s dependency closure.
    pub fn run_initializers(&mut self, root: ImageId) -> Result<()> {
        self.note_phase("running initializers");
        let mut initialized = Vec::new();
        let mut visiting = HashSet::new();
        self.recursive_initialize(root, &mut visiting, &mut initialized);
        self.notify_batch(ImageState::Initialized, &initialized);
        Ok(())
    }

    fn recursive_initialize(
        &mut self,
        id: ImageId,
        visiting: &mut HashSet<ImageId>,
        initialized: &mut Vec<ImageId>,
    ) {
        if !visiting.insert(id) {
            return;
        }
        {
            let image = self.registry.image(id);
            if image.state >= ImageState::DependentsInitialized {
                return;
            }
        }
        let my_depth = self.registry.image(id).depth;
        for dep in self.registry.static_deps(id) {
            // Depth guard breaks initialization cycles: only recurse into
            // images at or below us in the graph.
            if self.registry.image(dep).depth >= my_depth {
                self.recursive_initialize(dep, visiting, initialized);
            }
        }
        self.registry
            .image_mut(id)
            .set_state(ImageState::DependentsInitialized);

        // The per-image lock is recursive for this thread; other threads
        // wait until this image finishes initializing.
        self.registry.image(id).init_lock().acquire();
        let initializers = self.registry.image(id).initializers();
        let path = self.registry.image(id).path.clone();
        for init in &initializers {
            if self.ctx.env.prints("initializers") {
                info!(target: "initializers", "calling initializer {:#x} in {:?}", init, path);
            }
            (self.ctx.initializer_runner)(*init, &self.ctx.vars);
        }
        self.registry.image(id).init_lock().release();

        self.registry.image_mut(id).set_state(ImageState::Initialized);
        self.init_order.push(id);
        initialized.push(id);
    }

    ///////////////////////////////////////////
    // dtrace DOF registration
    ///////////////////////////////////////////

    fn register_dofs(&mut self, ids: &[ImageId]) {
        if self.ctx.env.disable_dofs {
            return;
        }
        for &id in ids {
            let runs: Vec<(u64, u64)> = self.registry.image(id).dof_runs.clone();
            for (addr, size) in runs {
                debug!(target: "dofs", "registering DOF section {:#x} ({} bytes)", addr, size);
                self.dof_registrations.push((id, addr, size));
            }
        }
    }

    ///////////////////////////////////////////
    // Runtime loading (dlopen/dlclose cores)
    ///////////////////////////////////////////

    /// The core of `dlopen`: load and link `path` and its dependencies,
    /// run their initializers, and bump the explicit-open count. Loading
    /// the same path again returns the same image.
    pub fn open(&mut self, path: &str, hide_exports: bool) -> Result<ImageId> {
        self.note_phase("dlopen");
        if let Some(existing) = self.find_loaded(Path::new(path)) {
            self.registry.image_mut(existing).open_count += 1;
            return Ok(existing);
        }
        let mut journal = LinkJournal::default();
        let executable_dir: Option<PathBuf> = self
            .main_image
            .and_then(|main| self.registry.get(main))
            .and_then(|main| main.path.parent().map(Path::to_path_buf));
        let mut flags = ImageFlags::empty();
        if hide_exports {
            flags |= ImageFlags::HIDE_EXPORTS;
        }
        let request = ResolveRequest {
            requested: path,
            executable_dir: executable_dir.as_deref(),
            loader_dir: executable_dir.as_deref(),
            loader_is_main: true,
            rpaths: RPathChain::EMPTY,
        };
        let id = match self.load_by_request(&request, flags, &mut journal) {
            Ok(id) => id,
            Err(err) => {
                self.unwind(journal);
                return Err(err);
            }
        };
        if let Err(err) = self.link_roots(&[id], false) {
            // link_roots unwound its own dependencies; drop the root too.
            self.unwind(journal);
            return Err(err);
        }
        self.run_initializers(id)?;
        self.registry.image_mut(id).open_count += 1;
        Ok(id)
    }

    /// The core of `dlclose`: drop the explicit-open count; at zero, the
    /// garbage collector decides what actually unloads.
    pub fn close(&mut self, id: ImageId) -> Result<()> {
        self.note_phase("dlclose");
        if !self.registry.contains(id) {
            return Ok(());
        }
        {
            let image = self.registry.image_mut(id);
            image.open_count = image.open_count.saturating_sub(1);
            if image.open_count > 0 || image.never_unload() {
                return Ok(());
            }
        }
        self.garbage_collect();
        Ok(())
    }

    /// Launch entry: runs initializers for every inserted library, then
    /// the main executable.
    pub fn initialize_main_executable(&mut self) -> Result<()> {
        let inserted = self.inserted.clone();
        for id in inserted {
            self.run_initializers(id)?;
        }
        if let Some(main) = self.main_image {
            self.run_initializers(main)?;
        }
        self.log_statistics();
        Ok(())
    }
}

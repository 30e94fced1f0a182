//! Unload garbage collection: mark every image reachable from a root
//! (open, never-unload) over static and dynamic edges; everything else is
//! terminated, unmapped, and dropped from the registry.

use std::collections::HashSet;

use log::debug;

use crate::image::ImageId;

use super::Linker;

impl Linker {
    /// Triggered at the end of any unload. Re-entrant only via the redo
    /// bit: a nested request (a terminator that unloads more) makes the
    /// outer loop run again until nothing changes.
    pub fn garbage_collect(&mut self) {
        if self.gc_in_progress {
            self.gc_redo = true;
            return;
        }
        self.gc_in_progress = true;
        loop {
            self.gc_redo = false;
            self.collect_once();
            if !self.gc_redo {
                break;
            }
        }
        self.gc_in_progress = false;
    }

    fn collect_once(&mut self) {
        // Mark phase: clear, then flood from the roots over both static
        // dependencies and dynamic references.
        let all: Vec<ImageId> = self.registry.load_order().to_vec();
        for &id in &all {
            self.registry.image_mut(id).gc_live = false;
        }
        let mut work: Vec<ImageId> = all
            .iter()
            .copied()
            .filter(|&id| {
                let image = self.registry.image(id);
                image.open_count > 0 || image.never_unload()
            })
            .collect();
        if let Some(main) = self.main_image {
            if self.registry.contains(main) {
                work.push(main);
            }
        }
        let mut seen: HashSet<ImageId> = HashSet::new();
        while let Some(id) = work.pop() {
            if !seen.insert(id) {
                continue;
            }
            self.registry.image_mut(id).gc_live = true;
            for next in self.registry.out_neighbors(id) {
                if !seen.contains(&next) {
                    work.push(next);
                }
            }
        }

        // Sweep: terminators first (in reverse initialization order),
        // then unmap and drop.
        let mut dead: Vec<ImageId> = self
            .init_order
            .iter()
            .rev()
            .copied()
            .filter(|&id| self.registry.contains(id) && !self.registry.image(id).gc_live)
            .collect();
        // Images that never initialized (failed or phase-partial loads)
        // still need removal.
        for &id in &all {
            if self.registry.contains(id)
                && !self.registry.image(id).gc_live
                && !dead.contains(&id)
            {
                dead.push(id);
            }
        }
        for &id in &dead {
            // A terminator can dlopen/dlclose; nested GC requests set the
            // redo bit handled by the outer loop.
            self.run_terminators_for(id);
            self.finalize_ranges(id);
        }
        for id in dead {
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
            let leave_mapped = self
                .registry
                .image(id)
                .flags
                .contains(crate::image::ImageFlags::LEAVE_MAPPED);
            debug!(
                target: "libraries",
                "unloading {:?}{}",
                self.registry.image(id).path,
                if leave_mapped { " (segments stay mapped)" } else { "" }
            );
            if let Some(mut image) = self.registry.remove(id) {
                if leave_mapped {
                    image.mapping.leak();
                }
                // Dropping the image unmaps its reservation.
            }
            self.init_order.retain(|&other| other != id);
        }
    }

    /// Run C++-style per-range finalizers over the executable segments of
    /// a dying image, when the embedder registered a hook.
    fn finalize_ranges(&mut self, id: ImageId) {
        let Some(finalizer) = &self.ctx.range_finalizer else {
            return;
        };
        let image = self.registry.image(id);
        let ranges: Vec<(u64, u64)> = image
            .mapping
            .segments()
            .iter()
            .filter(|seg| seg.initprot & crate::mach::constants::VM_PROT_EXECUTE != 0)
            .map(|seg| (seg.address, seg.vmsize))
            .collect();
        for (address, size) in ranges {
            finalizer(address, size);
        }
    }
}

//! Interposition: replacing every incoming bind of a symbol with a
//! user-supplied replacement, registered through `__interpose` sections
//! of inserted libraries.

use log::{debug, info};

use crate::error::Result;
use crate::image::{ImageId, ImageState};

use super::Linker;

/// One interposition registration. Tuples chain: a later interposer of
/// the same symbol gets its `replacee` rewritten to the earlier
/// replacement, so walking the list forwards both routes new binds to the
/// newest replacement and preserves each interposer's reach toward the
/// original.
#[derive(Debug, Clone, Copy)]
pub struct InterposeTuple {
    pub replacement: u64,
    pub replacee: u64,
    /// The registering image: its own binds never see this tuple (so a
    /// wrapper can still call the function it wraps).
    pub never_image: Option<ImageId>,
    /// When set, only this image's binds see the tuple.
    pub only_image: Option<ImageId>,
}

impl Linker {
    /// Read `__interpose` sections of `id` and register their tuples.
    /// A tuple whose replacement lies outside the registering image is
    /// ignored with a warning, not an error.
    pub fn register_interposing(&mut self, id: ImageId) {
        let image = self.registry.image(id);
        let word = image.word_size();
        let runs = image.interpose_runs.clone();
        let contains = |addr: u64| {
            self.registry
                .image(id)
                .mapping
                .segments()
                .iter()
                .any(|seg| seg.contains(addr))
        };
        let mut fresh = Vec::new();
        for (base, size) in runs {
            let pairs = size as usize / (word * 2);
            for i in 0..pairs {
                let entry = base + (i * word * 2) as u64;
                let image = self.registry.image(id);
                let replacement = image.mapping.read_pointer(entry, word);
                let replacee = image.mapping.read_pointer(entry + word as u64, word);
                if !contains(replacement) {
                    self.warn(&format!(
                        "interpose tuple in {:?} has replacement {:#x} outside the image; ignored",
                        self.registry.image(id).path,
                        replacement
                    ));
                    continue;
                }
                if contains(replacee) {
                    self.warn(&format!(
                        "interpose tuple in {:?} has replacee {:#x} inside the image; ignored",
                        self.registry.image(id).path,
                        replacee
                    ));
                    continue;
                }
                let mut tuple = InterposeTuple {
                    replacement,
                    replacee,
                    never_image: Some(id),
                    only_image: None,
                };
                // Chain onto existing interpositions of the same symbol.
                for existing in &self.interposers {
                    if existing.replacee == tuple.replacee {
                        tuple.replacee = existing.replacement;
                    }
                }
                fresh.push(tuple);
            }
        }
        for tuple in fresh {
            if self.ctx.env.prints("interposing") {
                info!(
                    target: "interposing",
                    "registered interpose {:#x} -> {:#x} from {:?}",
                    tuple.replacee,
                    tuple.replacement,
                    self.registry.image(id).path
                );
            }
            self.interposers.push(tuple);
        }
    }

    /// The replacement for `addr` as seen by `requestor`, walking the
    /// tuple list in registration order. Identity when nothing matches.
    pub fn interposed_address(&self, addr: u64, requestor: Option<ImageId>) -> u64 {
        let mut current = addr;
        for tuple in &self.interposers {
            if current == tuple.replacee
                && (tuple.never_image.is_none() || requestor != tuple.never_image)
                && (tuple.only_image.is_none() || requestor == tuple.only_image)
            {
                current = tuple.replacement;
            }
        }
        current
    }

    /// Rewrite `id`'s already-bound pointers through the tuple list.
    /// Used right after registration for images whose binds were written
    /// before the interposer existed; images bound later get interposed
    /// results at resolution time, and weak coalescing (which runs after
    /// registration) pipes its chosen addresses through the tuples when
    /// it patches.
    pub(crate) fn apply_interposing_to_image(&mut self, id: ImageId) -> Result<()> {
        if self.interposers.is_empty() {
            return Ok(());
        }
        if self.registry.image(id).state < ImageState::Bound {
            return Ok(());
        }
        let sites: Vec<(u64, u8)> = {
            let image = self.registry.image(id);
            let mut sites: Vec<(u64, u8)> = image
                .bind_records()?
                .iter()
                .map(|r| (r.address, r.kind))
                .collect();
            sites.extend(
                image
                    .lazy_bind_records()?
                    .iter()
                    .map(|(_, r)| (r.address, r.kind)),
            );
            sites.extend(
                image
                    .classic_bind_records()?
                    .iter()
                    .map(|r| (r.address, crate::linkedit::bind::BIND_TYPE_POINTER)),
            );
            sites
        };
        let word = self.registry.image(id).word_size();
        let mut rewritten = 0usize;
        for (address, kind) in sites {
            let old = self.registry.image(id).mapping.read_pointer(address, word);
            let new = self.interposed_address(old, Some(id));
            if new != old {
                self.registry.image_mut(id).write_bind(address, new, kind)?;
                rewritten += 1;
            }
        }
        self.registry.image_mut(id).finish_fixups()?;
        if rewritten > 0 {
            debug!(
                target: "interposing",
                "rewrote {} bound pointers in {:?}",
                rewritten,
                self.registry.image(id).path
            );
        }
        Ok(())
    }
}

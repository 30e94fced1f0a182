//! Weak-symbol coalescing: one definition is chosen for every weak
//! symbol name across the whole process, and every participating image's
//! weak-bind sites are patched to it.

use std::collections::BTreeMap;

use log::{debug, info};

use crate::error::Result;
use crate::image::{ImageFlags, ImageId, ImageState};

use super::Linker;

/// A weak site with the stream borrows dropped.
struct OwnedWeakSite {
    address: u64,
    kind: u8,
    addend: i64,
}

struct OwnedWeakEntry {
    strong_definition: bool,
    sites: Vec<OwnedWeakSite>,
}

impl Linker {
    /// Merge every participating image's weak-bind cursor by symbol name
    /// and, per symbol, choose a single definition: the first non-weak
    /// definition in registry order (inserted first), else the first weak
    /// one. Sites in every image at `bound` or later are patched to the
    /// choice.
    pub fn weak_coalesce(&mut self) -> Result<()> {
        let order = self.flat_search_order();
        let participants: Vec<ImageId> = order
            .iter()
            .copied()
            .filter(|&id| {
                let image = self.registry.image(id);
                image.flags
                    .intersects(ImageFlags::HAS_WEAK_DEFS | ImageFlags::BINDS_TO_WEAK)
                    && image.state >= ImageState::Bound
            })
            .collect();
        if participants.is_empty() {
            return Ok(());
        }

        // Advance every cursor to completion, keyed by symbol. BTreeMap
        // gives the merged, name-sorted view the cursors promise.
        let mut merged: BTreeMap<String, Vec<(ImageId, OwnedWeakEntry)>> = BTreeMap::new();
        for &id in &participants {
            let image = self.registry.image(id);
            let Some(mut cursor) = image.weak_bind_cursor()? else {
                continue;
            };
            while let Some(entry) = cursor.next_symbol()? {
                merged.entry(entry.name.to_string()).or_default().push((
                    id,
                    OwnedWeakEntry {
                        strong_definition: entry.strong_definition,
                        sites: entry
                            .sites
                            .iter()
                            .map(|site| OwnedWeakSite {
                                address: site.address,
                                kind: site.kind,
                                addend: site.addend,
                            })
                            .collect(),
                    },
                ));
            }
        }

        for (name, entries) in merged {
            // Choose the definition. Strong markers from the stream get
            // first claim, then the scan over images in registry order.
            let chosen = self.choose_weak_definition(&name, &participants, &entries)?;
            let Some((address, defined_in)) = chosen else {
                debug!(target: "weak-bindings", "no definition found for weak {}", name);
                continue;
            };
            if self.ctx.env.prints("weak_bindings") {
                info!(
                    target: "weak-bindings",
                    "coalesced {} -> {:#x} in {:?}",
                    name,
                    address,
                    defined_in.map(|id| self.registry.image(id).path.clone())
                );
            }
            self.stats.weak_symbols_coalesced += 1;
            for (id, entry) in &entries {
                if self.registry.image(*id).state < ImageState::Bound {
                    continue;
                }
                for site in &entry.sites {
                    // Interposing registered earlier in the link applies
                    // to the chosen address.
                    let value = self.interposed_address(address, Some(*id));
                    let value = (value as i64).wrapping_add(site.addend) as u64;
                    self.registry
                        .image_mut(*id)
                        .write_bind(site.address, value, site.kind)?;
                }
                if !entry.sites.is_empty() {
                    if let Some(def_id) = defined_in {
                        self.record_dynamic_reference(*id, def_id);
                    }
                }
            }
        }
        for &id in &participants {
            self.registry.image_mut(id).finish_fixups()?;
        }
        Ok(())
    }

    fn choose_weak_definition(
        &self,
        name: &str,
        participants: &[ImageId],
        entries: &[(ImageId, OwnedWeakEntry)],
    ) -> Result<Option<(u64, Option<ImageId>)>> {
        // A strong-definition marker in some image's stream wins for that
        // image's own definition.
        for (id, entry) in entries {
            if entry.strong_definition {
                if let Some(found) = self.lookup_definition(*id, name)? {
                    return Ok(Some((found.0, Some(*id))));
                }
            }
        }
        // First non-weak definition in registry order.
        let mut first_weak: Option<(u64, Option<ImageId>)> = None;
        for &id in participants {
            if let Some((address, weak)) = self.lookup_definition(id, name)? {
                if !weak {
                    return Ok(Some((address, Some(id))));
                }
                if first_weak.is_none() {
                    first_weak = Some((address, Some(id)));
                }
            }
        }
        Ok(first_weak)
    }

    fn lookup_definition(&self, id: ImageId, name: &str) -> Result<Option<(u64, bool)>> {
        let mut visited = std::collections::HashSet::new();
        Ok(self
            .search_exports(id, name, &mut visited)?
            .map(|found| (found.address, found.weak)))
    }
}

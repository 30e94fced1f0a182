//! The lazy-bind runtime: the slow path behind a stub's first call.
//!
//! A stub pushes the offset of its lazy-bind record and tails into the
//! binder. The binder identifies the image (from the per-image context
//! pointer the stub helper embeds, or by looking the stub's address up in
//! the registry range index), decodes the one record at that offset,
//! resolves the symbol, patches the lazy pointer in place, and returns
//! the target for the stub to jump to.

use log::{debug, info};

use crate::context::{LockedLinker, Linker};
use crate::error::{Error, Result};
use crate::image::ImageId;
use crate::linkedit::bind::Ordinal;

/// Bind one lazy symbol in `image`. Returns the resolved target address
/// after patching the lazy pointer.
pub fn bind_lazy_symbol(linker: &mut Linker, image: ImageId, lazy_offset: usize) -> Result<u64> {
    let (record_address, kind, ordinal, symbol, addend, weak_import) = {
        let image_ref = linker.registry.image(image);
        let record = image_ref.lazy_bind_record_at(lazy_offset)?;
        (
            record.address,
            record.kind,
            record.ordinal,
            record.symbol.to_string(),
            record.addend,
            record.weak_import,
        )
    };
    // There is no way to return "not found" through a stub, so a missing
    // symbol here is fatal even when the reference is weak.
    let resolved = linker
        .resolve_ordinal(image, ordinal, &symbol, weak_import)?
        .ok_or_else(|| Error::SymbolNotFound {
            symbol: symbol.clone(),
            referenced_from: linker.registry.image(image).path.clone(),
            expected_in: "lazy binding".into(),
        })?;
    let target = linker.interposed_address(resolved.address, Some(image));
    let value = (target as i64).wrapping_add(addend) as u64;
    linker
        .registry
        .image_mut(image)
        .write_bind(record_address, value, kind)?;
    linker.registry.image_mut(image).finish_fixups()?;
    if matches!(ordinal, Ordinal::FlatLookup) {
        if let Some(defined_in) = resolved.defined_in {
            linker.record_dynamic_reference(image, defined_in);
        }
    }
    linker.stats.lazy_binds += 1;
    if linker.ctx.env.prints("bindings") {
        info!(
            target: "bindings",
            "lazy bind {}: *{:#x} = {:#x}",
            symbol, record_address, value
        );
    } else {
        debug!(
            target: "bindings",
            "lazy bind {}: *{:#x} = {:#x}",
            symbol, record_address, value
        );
    }
    Ok(value)
}

/// The trampoline entry: identify the calling image by the stub-helper
/// address when no per-image context pointer was captured at map time.
///
/// The registry range index itself is readable without the writer lock;
/// the lock is taken here around resolution and the pointer patch.
pub fn stub_binder(
    linker: &LockedLinker,
    stub_address: u64,
    image_hint: Option<ImageId>,
    lazy_offset: usize,
) -> Result<u64> {
    linker.with(|linker| {
        let image = image_hint
            .filter(|&id| linker.registry.contains(id))
            .or_else(|| linker.registry.image_containing_address(stub_address))
            .ok_or_else(|| Error::MalformedImage {
                path: Default::default(),
                reason: format!("no image contains stub address {:#x}", stub_address),
            })?;
        bind_lazy_symbol(linker, image, lazy_offset)
    })
}

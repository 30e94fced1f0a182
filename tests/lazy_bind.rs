//! The stub-miss binder: one record decoded per call, pointer patched in
//! place, bind-at-launch forcing.

mod common;

use common::*;
use machload::context::LockedLinker;
use machload::image::{ImageFlags, ImageId};
use machload::lazy;
use machload::linkedit::bind::Ordinal;

const STUB_HELPER_OFF: u64 = 0x180;
const SLOT: u64 = 0x50;

fn lazy_client(fx: &Fixture, libc_path: &str) -> (std::path::PathBuf, Vec<usize>) {
    let mut builder = ImageBuilder::dylib("libclient").dep(DepSpec::regular(libc_path));
    builder.lazy_binds.push(BindSpec {
        data_offset: SLOT,
        ordinal: Ordinal::Library(1),
        symbol: "_printf".into(),
        weak_import: false,
    });
    // Lazy pointers start out aimed at the stub helper and slide with
    // the image.
    builder.data_words.push((SLOT, STUB_HELPER_OFF));
    builder.rebases.push(SLOT);
    let offsets = builder.lazy_offsets();
    (fx.write("libclient.dylib", &builder), offsets)
}

fn slot_value(linker: &machload::context::Linker, id: ImageId) -> u64 {
    let image = linker.registry.image(id);
    let data = image
        .mapping
        .segments()
        .iter()
        .find(|s| s.name == "__DATA")
        .unwrap()
        .address;
    image.mapping.read_pointer(data + SLOT, 8)
}

#[test]
fn first_call_binds_and_patches_the_pointer() {
    let fx = Fixture::new();
    let libc_path = fx.write(
        "libc_fake.dylib",
        &ImageBuilder::dylib("libc_fake").export_text("_printf", 0x200, false),
    );
    let (client_path, offsets) = lazy_client(&fx, libc_path.to_str().unwrap());

    let (mut linker, _) = recording_linker();
    let id = add_image(&mut linker, &client_path, ImageFlags::empty());
    linker.link_roots(&[id], false).unwrap();

    // Launch did not bind the lazy slot: it still aims at the stub
    // helper (slid).
    let slide = linker.registry.image(id).slide();
    assert_eq!(slot_value(&linker, id), (STUB_HELPER_OFF as i64 + slide) as u64);
    assert_eq!(linker.stats.lazy_binds, 0);

    let libc = linker.registry.image(id).deps[0].image.unwrap();
    let printf = linker.symbol_address(libc, "_printf").unwrap().unwrap();

    let target = lazy::bind_lazy_symbol(&mut linker, id, offsets[0]).unwrap();
    assert_eq!(target, printf);
    assert_eq!(slot_value(&linker, id), printf);
    assert_eq!(linker.stats.lazy_binds, 1);
}

#[test]
fn trampoline_identifies_the_image_by_address() {
    let fx = Fixture::new();
    let libc_path = fx.write(
        "libc_fake.dylib",
        &ImageBuilder::dylib("libc_fake").export_text("_printf", 0x200, false),
    );
    let (client_path, offsets) = lazy_client(&fx, libc_path.to_str().unwrap());

    let (mut linker, _) = recording_linker();
    let id = add_image(&mut linker, &client_path, ImageFlags::empty());
    linker.link_roots(&[id], false).unwrap();
    let stub_address = linker.registry.image(id).mapping.base_address() + STUB_HELPER_OFF;

    let locked = LockedLinker::new(linker);
    let target = lazy::stub_binder(&locked, stub_address, None, offsets[0]).unwrap();
    let linker = locked.into_inner();
    assert_eq!(slot_value(&linker, id), target);

    // A stub address belonging to no image is an error.
    let locked = LockedLinker::new(linker);
    assert!(lazy::stub_binder(&locked, 0x10, None, offsets[0]).is_err());
}

#[test]
fn bind_at_launch_forces_lazy_binds() {
    let fx = Fixture::new();
    let libc_path = fx.write(
        "libc_fake.dylib",
        &ImageBuilder::dylib("libc_fake").export_text("_printf", 0x200, false),
    );
    let (client_path, _) = lazy_client(&fx, libc_path.to_str().unwrap());

    let (mut linker, _) = recording_linker();
    linker.ctx.env.bind_at_launch = true;
    let id = add_image(&mut linker, &client_path, ImageFlags::empty());
    linker.link_roots(&[id], false).unwrap();

    let libc = linker.registry.image(id).deps[0].image.unwrap();
    let printf = linker.symbol_address(libc, "_printf").unwrap().unwrap();
    assert_eq!(slot_value(&linker, id), printf);
}

#[test]
fn missing_lazy_symbol_is_fatal() {
    let fx = Fixture::new();
    let libc_path = fx.write(
        "libc_fake.dylib",
        &ImageBuilder::dylib("libc_fake").export_text("_printf", 0x200, false),
    );
    let mut builder = ImageBuilder::dylib("libclient")
        .dep(DepSpec::regular(libc_path.to_str().unwrap()));
    builder.lazy_binds.push(BindSpec {
        data_offset: SLOT,
        ordinal: Ordinal::Library(1),
        symbol: "_gone".into(),
        weak_import: true,
    });
    builder.data_words.push((SLOT, STUB_HELPER_OFF));
    let offsets = builder.lazy_offsets();
    let path = fx.write("libclient.dylib", &builder);

    let (mut linker, _) = recording_linker();
    let id = add_image(&mut linker, &path, ImageFlags::empty());
    linker.link_roots(&[id], false).unwrap();
    // Even a weak import cannot report failure through a stub.
    assert!(lazy::bind_lazy_symbol(&mut linker, id, offsets[0]).is_err());
}

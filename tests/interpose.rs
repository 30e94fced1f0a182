//! Interposition: tuple registration from `__interpose` sections, the
//! chain across multiple interposers, the never-image exclusion, and the
//! interaction with weak coalescing.

mod common;

use common::*;
use machload::image::{ImageFlags, ImageId};
use machload::linkedit::bind::Ordinal;

fn data_word(linker: &machload::context::Linker, id: ImageId, off: u64) -> u64 {
    let image = linker.registry.image(id);
    let data = image
        .mapping
        .segments()
        .iter()
        .find(|s| s.name == "__DATA")
        .unwrap()
        .address;
    image.mapping.read_pointer(data + off, 8)
}

/// An inserted library exporting `_malloc_X` at __TEXT+0x300, interposing
/// `_malloc`, and carrying its own bound reference to `_malloc` at
/// __DATA+0x40.
fn interposer(fx: &Fixture, name: &str, libc_path: &str) -> std::path::PathBuf {
    let mut builder = ImageBuilder::dylib(name)
        .dep(DepSpec::regular(libc_path))
        .export_text(&format!("_malloc_{}", name), 0x300, false)
        .bind(0x40, Ordinal::Library(1), "_malloc");
    builder
        .interpose
        .push((0x300, Ordinal::Library(1), "_malloc".into()));
    fx.write(&format!("{}.dylib", name), &builder)
}

#[test]
fn interpose_chains_across_inserted_libraries() {
    let fx = Fixture::new();
    let libc_path = fx.write(
        "libc_fake.dylib",
        &ImageBuilder::dylib("libc_fake").export_text("_malloc", 0x200, false),
    );
    let a_path = interposer(&fx, "A", libc_path.to_str().unwrap());
    let b_path = interposer(&fx, "B", libc_path.to_str().unwrap());

    let main_builder = ImageBuilder::executable(0x1_0000_0000)
        .dep(DepSpec::regular(libc_path.to_str().unwrap()))
        .bind(0x0, Ordinal::Library(1), "_malloc");
    let main_path = fx.write("main", &main_builder);

    let (mut linker, _) = recording_linker();
    let main = add_image(&mut linker, &main_path, ImageFlags::NEVER_UNLOAD);
    linker.set_main_image(main);
    let a = add_image(
        &mut linker,
        &a_path,
        ImageFlags::INSERTED | ImageFlags::NEVER_UNLOAD,
    );
    let b = add_image(
        &mut linker,
        &b_path,
        ImageFlags::INSERTED | ImageFlags::NEVER_UNLOAD,
    );
    linker.add_inserted(a);
    linker.add_inserted(b);
    // The launch sequence registers the inserted libraries' tuples once
    // all of them are bound, then rewrites the already-written binds.
    linker.link_roots(&[main, a, b], false).unwrap();

    let libc = linker.registry.image(main).deps[0].image.unwrap();
    let malloc_orig = linker.symbol_address(libc, "_malloc").unwrap().unwrap();
    let malloc_a = linker.registry.image(a).mapping.base_address() + 0x300;
    let malloc_b = linker.registry.image(b).mapping.base_address() + 0x300;

    // The outside world reaches the newest interposer.
    assert_eq!(data_word(&linker, main, 0x0), malloc_b);
    // B's own "original" is A's replacement (the chain), and A's is the
    // real malloc, so neither wrapper can recurse into itself.
    assert_eq!(data_word(&linker, b, 0x40), malloc_a);
    assert_eq!(data_word(&linker, a, 0x40), malloc_orig);

    // New resolutions walk the whole chain too.
    let via_resolution = linker.interposed_address(malloc_orig, Some(main));
    assert_eq!(via_resolution, malloc_b);
    assert_eq!(linker.interposed_address(malloc_orig, Some(a)), malloc_orig);
    assert_eq!(linker.interposed_address(malloc_orig, Some(b)), malloc_a);
}

#[test]
fn interposition_redirects_coalesced_weak_binds() {
    let fx = Fixture::new();
    // The definition being interposed is itself weak.
    let libc_path = fx.write(
        "libc_fake.dylib",
        &ImageBuilder::dylib("libc_fake").export_text("_walloc", 0x200, true),
    );
    let a_path = {
        let mut builder = ImageBuilder::dylib("A")
            .dep(DepSpec::regular(libc_path.to_str().unwrap()))
            .export_text("_walloc_A", 0x300, false);
        builder
            .interpose
            .push((0x300, Ordinal::Library(1), "_walloc".into()));
        fx.write("A.dylib", &builder)
    };
    // The main executable reaches _walloc through a weak-bind site, the
    // path that is patched by coalescing rather than by regular binding.
    let mut main_builder = ImageBuilder::executable(0x1_0000_0000)
        .dep(DepSpec::regular(libc_path.to_str().unwrap()));
    main_builder.weak_refs.push((0x60, "_walloc".into()));
    let main_path = fx.write("main", &main_builder);

    let (mut linker, _) = recording_linker();
    let main = add_image(&mut linker, &main_path, ImageFlags::NEVER_UNLOAD);
    linker.set_main_image(main);
    let a = add_image(
        &mut linker,
        &a_path,
        ImageFlags::INSERTED | ImageFlags::NEVER_UNLOAD,
    );
    linker.add_inserted(a);
    linker.link_roots(&[main, a], false).unwrap();

    let libc = linker.registry.image(main).deps[0].image.unwrap();
    let walloc_a = linker.registry.image(a).mapping.base_address() + 0x300;
    assert_eq!(
        linker.symbol_address(a, "_walloc_A").unwrap(),
        Some(walloc_a)
    );

    // Weak binding ran after interposing registration, so the coalesced
    // pointer in main already carries the replacement, not the plain
    // weak definition in libc_fake.
    assert_eq!(data_word(&linker, main, 0x60), walloc_a);
    // A's own interpose replacee still reaches the real weak definition.
    let libc_walloc = linker
        .registry
        .image(libc)
        .mapping
        .base_address()
        + 0x200;
    assert_eq!(data_word(&linker, a, common::INTERPOSE_OFF + 8), libc_walloc);
}

#[test]
fn interpose_tuples_must_point_into_their_image() {
    let fx = Fixture::new();
    let libc_path = fx.write(
        "libc_fake.dylib",
        &ImageBuilder::dylib("libc_fake").export_text("_malloc", 0x200, false),
    );
    // The "replacement" is the imported _malloc itself: outside the
    // registering image, so the tuple must be ignored.
    let mut bogus = ImageBuilder::dylib("libbogus").dep(DepSpec::regular(
        libc_path.to_str().unwrap(),
    ));
    bogus.binds.push(BindSpec {
        data_offset: common::INTERPOSE_OFF,
        ordinal: Ordinal::Library(1),
        symbol: "_malloc".into(),
        weak_import: false,
    });
    bogus.binds.push(BindSpec {
        data_offset: common::INTERPOSE_OFF + 8,
        ordinal: Ordinal::Library(1),
        symbol: "_malloc".into(),
        weak_import: false,
    });
    // Declare one interpose pair so the section exists, but overwrite
    // both words with out-of-image values via the binds above.
    bogus.interpose.push((0x300, Ordinal::Library(1), "_malloc".into()));
    let path = fx.write("libbogus.dylib", &bogus);

    let (mut linker, _) = recording_linker();
    let id = add_image(
        &mut linker,
        &path,
        ImageFlags::INSERTED | ImageFlags::NEVER_UNLOAD,
    );
    linker.add_inserted(id);
    // Registration happens during the link; the replacement points into
    // libc_fake, not libbogus, so the tuple is rejected.
    linker.link_roots(&[id], false).unwrap();
    let malloc_orig = {
        let libc = linker.registry.image(id).deps[0].image.unwrap();
        linker.symbol_address(libc, "_malloc").unwrap().unwrap()
    };
    assert_eq!(linker.interposed_address(malloc_orig, None), malloc_orig);
}

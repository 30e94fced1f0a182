//! The recursive link sequence: dependency loading, state ordering,
//! initializer order, failure modes, and handler rejection.

mod common;

use common::*;
use machload::Error;
use machload::image::{ImageFlags, ImageState};
use machload::linkedit::bind::Ordinal;

#[test]
fn initializers_run_bottom_up() {
    let fx = Fixture::new();
    // C ← A, C ← B, {A, B} ← main.
    let mut libc_builder = ImageBuilder::dylib("libC");
    libc_builder.init_funcs.push(0x100);
    let c_path = fx.write("libC.dylib", &libc_builder.export_text("_c", 0x140, false));

    let mut a_builder =
        ImageBuilder::dylib("libA").dep(DepSpec::regular(c_path.to_str().unwrap()));
    a_builder.init_funcs.push(0x100);
    let a_path = fx.write(
        "libA.dylib",
        &a_builder.bind(0x0, Ordinal::Library(1), "_c"),
    );

    let mut b_builder =
        ImageBuilder::dylib("libB").dep(DepSpec::regular(c_path.to_str().unwrap()));
    b_builder.init_funcs.push(0x100);
    let b_path = fx.write(
        "libB.dylib",
        &b_builder.bind(0x0, Ordinal::Library(1), "_c"),
    );

    let mut main_builder = ImageBuilder::executable(0x1_0000_0000)
        .dep(DepSpec::regular(a_path.to_str().unwrap()))
        .dep(DepSpec::regular(b_path.to_str().unwrap()));
    main_builder.init_funcs.push(0x1_0000_0100);
    let main_path = fx.write("main", &main_builder);

    let (mut linker, calls) = recording_linker();
    let main = add_image(&mut linker, &main_path, ImageFlags::NEVER_UNLOAD);
    linker.set_main_image(main);
    linker.link_roots(&[main], false).unwrap();

    // Invariant: a dependency's state is never behind its dependent's.
    for &id in linker.registry.load_order() {
        let state = linker.registry.image(id).state;
        for dep in linker.registry.static_deps(id) {
            assert!(linker.registry.image(dep).state >= state);
        }
    }
    assert_eq!(linker.registry.len(), 4);

    linker.run_initializers(main).unwrap();

    // Map recorded initializer entry addresses back to their images; the
    // order must be a topological sort of the dependency DAG.
    let order: Vec<_> = calls
        .lock()
        .unwrap()
        .iter()
        .map(|&addr| linker.image_containing_address(addr).unwrap())
        .collect();
    assert_eq!(order.len(), 4);
    let position = |id| order.iter().position(|&o| o == id).unwrap();
    let a = linker.registry.image(main).deps[0].image.unwrap();
    let b = linker.registry.image(main).deps[1].image.unwrap();
    let c = linker.registry.image(a).deps[0].image.unwrap();
    assert!(position(c) < position(a));
    assert!(position(c) < position(b));
    assert!(position(a) < position(main));
    assert!(position(b) < position(main));

    // Depths are consistent with the sort: dependencies at least as deep.
    assert!(linker.registry.image(c).depth >= linker.registry.image(a).depth);
    assert!(linker.registry.image(a).depth >= linker.registry.image(main).depth);
}

#[test]
fn missing_required_library_fails_missing_weak_is_null() {
    let fx = Fixture::new();
    let required = ImageBuilder::dylib("libneedy")
        .dep(DepSpec::regular("/definitely/not/here/libgone.dylib"));
    let path = fx.write("libneedy.dylib", &required);
    let (mut linker, _) = recording_linker();
    let id = add_image(&mut linker, &path, ImageFlags::empty());
    let err = linker.link_roots(&[id], false).unwrap_err();
    assert!(matches!(err, Error::MissingLibrary { .. }));

    let mut weak = ImageBuilder::dylib("libtolerant")
        .dep(DepSpec::weak("/definitely/not/here/libgone.dylib"))
        .bind(0x8, Ordinal::Library(1), "_from_gone");
    weak.data_words.push((0x8, 0xffff_ffff));
    let path = fx.write("libtolerant.dylib", &weak);
    let (mut linker, _) = recording_linker();
    let id = add_image(&mut linker, &path, ImageFlags::empty());
    linker.link_roots(&[id], false).unwrap();
    let image = linker.registry.image(id);
    assert!(image.deps[0].image.is_none());
    assert_eq!(image.state, ImageState::Bound);
    // Binds through the missing weak library resolve to zero.
    let data = image
        .mapping
        .segments()
        .iter()
        .find(|s| s.name == "__DATA")
        .unwrap()
        .address;
    assert_eq!(image.mapping.read_pointer(data + 0x8, 8), 0);
}

#[test]
fn compatibility_version_is_enforced() {
    let fx = Fixture::new();
    let lib = fx.write("libold.dylib", &ImageBuilder::dylib("libold"));
    let mut dep = DepSpec::regular(lib.to_str().unwrap());
    dep.compat = 0x2_0000; // requires 2.0.0, the library provides 1.0.0
    let client = ImageBuilder::dylib("libclient").dep(dep);
    let path = fx.write("libclient.dylib", &client);

    let (mut linker, _) = recording_linker();
    let id = add_image(&mut linker, &path, ImageFlags::empty());
    let err = linker.link_roots(&[id], false).unwrap_err();
    assert!(matches!(err, Error::VersionMismatch { .. }));
}

#[test]
fn undefined_symbols_fail_weak_imports_bind_zero() {
    let fx = Fixture::new();
    let lib = fx.write("libdefs.dylib", &ImageBuilder::dylib("libdefs"));

    let bad = ImageBuilder::dylib("libbad")
        .dep(DepSpec::regular(lib.to_str().unwrap()))
        .bind(0x0, Ordinal::Library(1), "_no_such_symbol");
    let path = fx.write("libbad.dylib", &bad);
    let (mut linker, _) = recording_linker();
    let id = add_image(&mut linker, &path, ImageFlags::empty());
    let err = linker.link_roots(&[id], false).unwrap_err();
    match err {
        Error::SymbolNotFound { symbol, .. } => assert_eq!(symbol, "_no_such_symbol"),
        other => panic!("unexpected error {:?}", other),
    }
    // The failed image dropped back to the pre-bind state.
    assert_eq!(linker.registry.image(id).state, ImageState::Rebased);

    let mut tolerant = ImageBuilder::dylib("libweakimp")
        .dep(DepSpec::regular(lib.to_str().unwrap()));
    tolerant.binds.push(BindSpec {
        data_offset: 0x0,
        ordinal: Ordinal::Library(1),
        symbol: "_no_such_symbol".into(),
        weak_import: true,
    });
    tolerant.data_words.push((0x0, 0xffff_ffff));
    let path = fx.write("libweakimp.dylib", &tolerant);
    let (mut linker, _) = recording_linker();
    let id = add_image(&mut linker, &path, ImageFlags::empty());
    linker.link_roots(&[id], false).unwrap();
    let image = linker.registry.image(id);
    let data = image
        .mapping
        .segments()
        .iter()
        .find(|s| s.name == "__DATA")
        .unwrap()
        .address;
    assert_eq!(image.mapping.read_pointer(data, 8), 0);
}

#[test]
fn handler_can_reject_a_load_batch() {
    let fx = Fixture::new();
    let dep = fx.write("libinner.dylib", &ImageBuilder::dylib("libinner"));
    let outer = ImageBuilder::dylib("libouter").dep(DepSpec::regular(dep.to_str().unwrap()));
    let outer_path = fx.write("libouter.dylib", &outer);

    let (mut linker, _) = recording_linker();
    linker.register_state_handler(
        ImageState::DependentsMapped,
        Box::new(|_, batch| {
            batch
                .iter()
                .any(|image| image.path.to_string_lossy().contains("libinner"))
                .then(|| "policy says no".to_string())
        }),
    );
    let before = linker.registry.len();
    let err = linker.open(outer_path.to_str().unwrap(), false).unwrap_err();
    assert!(matches!(err, Error::HandlerRejected { .. }));
    // The failed sub-graph was fully rolled back.
    assert_eq!(linker.registry.len(), before);
}

#[test]
fn signature_rejection_is_fatal() {
    let fx = Fixture::new();
    let path = fx.write("libsig.dylib", &ImageBuilder::dylib("libsig"));
    let (mut linker, _) = recording_linker();
    linker.ctx.signature_validator = Some(Box::new(|_| false));
    let err = linker.open(path.to_str().unwrap(), false).unwrap_err();
    assert!(matches!(err, Error::SignatureInvalid { .. }));
    assert!(linker.registry.is_empty());
}

#[test]
fn rpath_resolution_uses_the_loader_chain() {
    let fx = Fixture::new();
    std::fs::create_dir_all(fx.path("nested")).unwrap();
    let dep = ImageBuilder::dylib("@rpath/librp.dylib");
    fx.write("nested/librp.dylib", &dep);

    let mut client = ImageBuilder::dylib("libclient")
        .dep(DepSpec::regular("@rpath/librp.dylib"));
    client.rpaths.push("@loader_path/nested".into());
    let client_path = fx.write("libclient.dylib", &client);

    let (mut linker, _) = recording_linker();
    let id = add_image(&mut linker, &client_path, ImageFlags::empty());
    linker.link_roots(&[id], false).unwrap();
    let dep_id = linker.registry.image(id).deps[0].image.unwrap();
    assert!(
        linker
            .registry
            .image(dep_id)
            .path
            .ends_with("nested/librp.dylib")
    );
}

//! Runtime open/close, reference counting, terminator ordering, and the
//! unload garbage collector.

mod common;

use common::*;
use machload::image::ImageFlags;
use machload::linkedit::bind::Ordinal;

#[test]
fn open_close_cycle_unloads_the_subgraph() {
    let fx = Fixture::new();
    let mut y_builder = ImageBuilder::dylib("libY").export_text("_y", 0x140, false);
    y_builder.init_funcs.push(0x100);
    y_builder.term_funcs.push(0x160);
    let y_path = fx.write("libY.dylib", &y_builder);

    let mut x_builder = ImageBuilder::dylib("libX")
        .dep(DepSpec::regular(y_path.to_str().unwrap()))
        .bind(0x0, Ordinal::Library(1), "_y");
    x_builder.init_funcs.push(0x100);
    x_builder.term_funcs.push(0x160);
    let x_path = fx.write("libX.dylib", &x_builder);

    let (mut linker, calls) = recording_linker();
    let x = linker.open(x_path.to_str().unwrap(), false).unwrap();
    assert_eq!(linker.registry.image(x).open_count, 1);
    let y = linker.registry.image(x).deps[0].image.unwrap();
    let y_sym = linker.symbol_address(y, "_y").unwrap().unwrap();
    let x_term = {
        let image = linker.registry.image(x);
        (0x160i64 + image.slide()) as u64
    };
    let y_term = {
        let image = linker.registry.image(y);
        (0x160i64 + image.slide()) as u64
    };

    // Initializers ran bottom-up: Y then X.
    {
        let log = calls.lock().unwrap();
        assert_eq!(log.len(), 2);
        let y_init = (0x100i64 + linker.registry.image(y).slide()) as u64;
        assert_eq!(log[0], y_init);
    }

    // Opening the same path again is the same image, one more count.
    let again = linker.open(x_path.to_str().unwrap(), false).unwrap();
    assert_eq!(again, x);
    assert_eq!(linker.registry.image(x).open_count, 2);

    // First close: still referenced.
    linker.close(x).unwrap();
    assert!(linker.registry.contains(x));

    // Second close: the whole sub-graph collects. Terminators run in
    // reverse initialization order (X before Y) before anything unmaps.
    linker.close(x).unwrap();
    assert!(!linker.registry.contains(x));
    assert!(!linker.registry.contains(y));
    assert_eq!(linker.image_containing_address(y_sym), None);
    let log = calls.lock().unwrap();
    assert_eq!(&log[2..], &[x_term, y_term]);
}

#[test]
fn dynamic_references_keep_flat_targets_alive() {
    let fx = Fixture::new();
    let z_path = fx.write(
        "libZ.dylib",
        &ImageBuilder::dylib("libZ").export_text("_z", 0x140, false),
    );
    let user_path = fx.write(
        "libuser.dylib",
        &ImageBuilder::dylib("libuser").bind(0x0, Ordinal::FlatLookup, "_z"),
    );

    let (mut linker, _) = recording_linker();
    let z = linker.open(z_path.to_str().unwrap(), false).unwrap();
    let user = linker.open(user_path.to_str().unwrap(), false).unwrap();
    assert_eq!(linker.registry.image(z).dynamic_ref_count, 1);

    // Z's own handle closes, but the dynamic reference from the flat
    // bind keeps it mapped.
    linker.close(z).unwrap();
    assert!(linker.registry.contains(z));

    // Once the user goes away, nothing reaches Z.
    linker.close(user).unwrap();
    assert!(!linker.registry.contains(user));
    assert!(!linker.registry.contains(z));
}

#[test]
fn never_unload_images_survive_close() {
    let fx = Fixture::new();
    let path = fx.write("libpin.dylib", &ImageBuilder::dylib("libpin"));
    let (mut linker, _) = recording_linker();
    let id = add_image(
        &mut linker,
        &path,
        ImageFlags::NEVER_UNLOAD,
    );
    linker.link_roots(&[id], false).unwrap();
    linker.run_initializers(id).unwrap();
    linker.close(id).unwrap();
    assert!(linker.registry.contains(id));
}

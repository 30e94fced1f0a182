//! Mapping, rebasing, export lookup, and the address range index.

mod common;

use common::*;
use machload::Error;
use machload::image::{ImageFlags, ImageState};

fn data_base(linker: &machload::context::Linker, id: machload::image::ImageId) -> u64 {
    linker
        .registry
        .image(id)
        .mapping
        .segments()
        .iter()
        .find(|s| s.name == "__DATA")
        .unwrap()
        .address
}

#[test]
fn maps_slides_and_rebases() {
    let fx = Fixture::new();
    let mut builder = ImageBuilder::dylib("/libs/libfoo.dylib");
    builder.rebases.push(0x0);
    // An unslid pointer to __TEXT+0x100; rebase must slide it.
    builder.data_words.push((0x0, 0x100));
    let builder = builder
        .export_text("_foo", 0x140, false)
        .export_data("_foo_data", 0x10, false);
    let path = fx.write("libfoo.dylib", &builder);

    let (mut linker, _) = recording_linker();
    let id = add_image(&mut linker, &path, ImageFlags::empty());
    linker.link_roots(&[id], false).unwrap();

    let image = linker.registry.image(id);
    let slide = image.slide();
    assert_ne!(slide, 0, "preferred base 0 must slide");
    assert_eq!(image.state, ImageState::Bound);

    let text = image.mapping.base_address();
    assert_eq!(text as i64, slide);

    // The rebased word now carries the slid address.
    let data = data_base(&linker, id);
    assert_eq!(image.mapping.read_pointer(data, 8), (0x100i64 + slide) as u64);

    // Exports resolve to slid addresses.
    assert_eq!(
        linker.symbol_address(id, "_foo").unwrap(),
        Some(text + 0x140)
    );
    assert_eq!(
        linker.symbol_address(id, "_foo_data").unwrap(),
        Some(data + 0x10)
    );
    assert_eq!(linker.symbol_address(id, "_absent").unwrap(), None);
}

#[test]
fn range_index_covers_every_accessible_segment() {
    let fx = Fixture::new();
    let path = fx.write(
        "libranges.dylib",
        &ImageBuilder::dylib("/libs/libranges.dylib"),
    );
    let (mut linker, _) = recording_linker();
    let id = add_image(&mut linker, &path, ImageFlags::empty());

    let spans: Vec<(u64, u64)> = linker
        .registry
        .image(id)
        .mapping
        .segments()
        .iter()
        .filter(|s| s.is_accessible())
        .map(|s| (s.address, s.end()))
        .collect();
    assert!(spans.len() >= 3);
    let image_end = spans.iter().map(|&(_, end)| end).max().unwrap();
    for (start, end) in spans {
        for addr in [start, start + (end - start) / 2, end - 1] {
            assert_eq!(
                linker.image_containing_address(addr),
                Some(id),
                "address {:#x} must map back to its image",
                addr
            );
        }
    }
    assert_eq!(linker.image_containing_address(image_end), None);

    // Unloading clears the index.
    let base = linker.registry.image(id).mapping.base_address();
    linker.registry.remove(id);
    assert_eq!(linker.image_containing_address(base), None);
}

#[test]
fn rejects_malformed_files() {
    let fx = Fixture::new();
    let path = fx.path("garbage.dylib");
    std::fs::write(&path, b"\xde\xad\xbe\xef not a mach-o").unwrap();

    let file = std::fs::File::open(&path).unwrap();
    let meta = file.metadata().unwrap();
    let opts = machload::image::LoadOptions {
        host: HOST,
        entropy: 1,
        flags: ImageFlags::empty(),
    };
    let err = machload::image::Image::load_from_file(&path, &file, &meta, &opts).unwrap_err();
    assert!(matches!(err, Error::MalformedImage { .. }));
}

#[test]
fn rejects_wrong_architecture() {
    let fx = Fixture::new();
    let path = fx.write("libarm.dylib", &ImageBuilder::dylib("/libs/libarm.dylib"));

    let file = std::fs::File::open(&path).unwrap();
    let meta = file.metadata().unwrap();
    let opts = machload::image::LoadOptions {
        host: (
            machload::mach::cputype::CPU_TYPE_ARM64,
            machload::mach::cputype::CPU_SUBTYPE_ARM64_ALL,
        ),
        entropy: 1,
        flags: ImageFlags::empty(),
    };
    let err = machload::image::Image::load_from_file(&path, &file, &meta, &opts).unwrap_err();
    assert!(matches!(err, Error::UnsupportedArch { .. }));
}

#[test]
fn same_file_loads_once() {
    let fx = Fixture::new();
    let path = fx.write("libonce.dylib", &ImageBuilder::dylib("/libs/libonce.dylib"));
    let (mut linker, _) = recording_linker();
    let id = add_image(&mut linker, &path, ImageFlags::empty());
    linker.link_roots(&[id], false).unwrap();

    let reopened = linker.open(path.to_str().unwrap(), false).unwrap();
    assert_eq!(reopened, id);
    assert_eq!(linker.registry.len(), 1);
}

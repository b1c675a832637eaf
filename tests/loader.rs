//! Self-relocation of the flat image.

mod common;

use common::ObjBuilder;
use hobgoblin::image::flat::{self, ProgramHeader};
use hobgoblin::ingest::{fix_relocation_targets, ingest_bytes};
use hobgoblin::link::{LinkOptions, Linker};
use hobgoblin::loader;
use hobgoblin::obj::reloc::{R_X86_64_64, R_X86_64_PC32};
use hobgoblin::store::Store;
use hobgoblin::store::schema::SectionKind;
use scroll::Pread;

const ABS_SITE: usize = 0x8;
const PC_SITE: usize = 0x14;

fn store_with_pointerful_module() -> Store {
    let mut store = Store::in_memory();
    let mut builder = ObjBuilder::new("boot");
    let text = builder.section(".text", 16, &[0x90u8; 32]);
    let data = builder.section(".data", 8, &[0u8; 16]);
    builder.bss(".bss", 16, 0x20);
    builder.func("_start", text, 0, 32);
    let counter = builder.object("counter", data, 0, 8);
    builder.rela(text, ABS_SITE as u64, counter, R_X86_64_64, 0);
    builder.rela(text, PC_SITE as u64, counter, R_X86_64_PC32, -4);
    ingest_bytes(&mut store, "boot", &builder.build()).unwrap();
    fix_relocation_targets(&mut store).unwrap();
    store
}

fn link_and_emit(store: &Store, base: u64) -> Vec<u8> {
    let linker = Linker::link(
        store,
        LinkOptions {
            entrypoint: "_start".into(),
            program_start_physical: base,
            program_start_virtual: base,
            recursive: false,
            with_symbol_names: false,
        },
    )
    .unwrap();
    flat::emit(&linker, store.stack_size()).unwrap()
}

#[test]
fn rebasing_shifts_absolute_sites_and_cancels_pc_relative_ones() {
    let store = store_with_pointerful_module();
    let image = link_and_emit(&store, 0x200000);
    let header = ProgramHeader::parse(&image).unwrap();

    let text_at = header.program.file_offset as usize;
    let abs_before: u64 = image.pread_with(text_at + ABS_SITE, scroll::LE).unwrap();
    let pc_before: u32 = image.pread_with(text_at + PC_SITE, scroll::LE).unwrap();

    let (_, got_before) = loader::inspect(&image).unwrap();

    // re-home: header moves from 0x1ff000 to 0x5ff000
    let mut rebased = image.clone();
    let entry = loader::relocate(&mut rebased, 0x5ff000).unwrap();
    let delta = 0x400000u64;

    assert_eq!(entry, header.entry_point + delta);

    let abs_after: u64 = rebased.pread_with(text_at + ABS_SITE, scroll::LE).unwrap();
    let pc_after: u32 = rebased.pread_with(text_at + PC_SITE, scroll::LE).unwrap();
    assert_eq!(abs_after, abs_before + delta);
    assert_eq!(pc_after, pc_before);

    // every non-zero GOT entry shifted by delta
    let (header_after, got_after) = loader::inspect(&rebased).unwrap();
    assert_eq!(header_after.header_virtual_address, 0x5ff000);
    for (before, after) in got_before.iter().zip(&got_after) {
        if before.entry_value == 0 {
            assert_eq!(after.entry_value, 0);
        } else {
            assert_eq!(after.entry_value, before.entry_value + delta);
        }
    }
}

#[test]
fn rebasing_matches_a_fresh_link_at_the_new_base() {
    let store = store_with_pointerful_module();
    let image = link_and_emit(&store, 0x200000);
    let fresh = link_and_emit(&store, 0x600000);

    let mut rebased = image;
    loader::relocate(&mut rebased, 0x5ff000).unwrap();

    let header = ProgramHeader::parse(&rebased).unwrap();
    let fresh_header = ProgramHeader::parse(&fresh).unwrap();
    assert_eq!(header.entry_point, fresh_header.entry_point);

    // the program bytes agree exactly: same sites, same values
    let at = header.program.file_offset as usize;
    let fresh_at = fresh_header.program.file_offset as usize;
    let size = header.program.size as usize;
    assert_eq!(rebased[at..at + size], fresh[fresh_at..fresh_at + size]);

    // and so does the GOT
    let (_, got_rebased) = loader::inspect(&rebased).unwrap();
    let (_, got_fresh) = loader::inspect(&fresh).unwrap();
    for (rebased_entry, fresh_entry) in got_rebased.iter().zip(&got_fresh) {
        assert_eq!(rebased_entry.entry_value, fresh_entry.entry_value);
    }
}

#[test]
fn rebasing_twice_round_trips() {
    let store = store_with_pointerful_module();
    let image = link_and_emit(&store, 0x200000);

    let mut walked = image.clone();
    loader::relocate(&mut walked, 0x5ff000).unwrap();
    loader::relocate(&mut walked, 0x1ff000).unwrap();

    let header = ProgramHeader::parse(&image).unwrap();
    let walked_header = ProgramHeader::parse(&walked).unwrap();
    assert_eq!(header.entry_point, walked_header.entry_point);
    let at = header.program.file_offset as usize;
    let size = header.program.size as usize;
    assert_eq!(image[at..at + size], walked[at..at + size]);
}

#[test]
fn relocation_zeroes_the_bss_span() {
    let store = store_with_pointerful_module();
    let mut image = link_and_emit(&store, 0x200000);
    let header = ProgramHeader::parse(&image).unwrap();

    // dirty the BSS span, as stale memory at load time would be
    let metadata = &image[header.metadata.file_offset as usize
        ..(header.metadata.file_offset + header.metadata.size) as usize];
    let metas = hobgoblin::image::parse_metadata(metadata).unwrap();
    let (bss_phys, _, bss_size) = metas[0].section(SectionKind::Bss).unwrap();
    let bss_at = (bss_phys - header.header_physical_address) as usize;
    for byte in &mut image[bss_at..bss_at + bss_size as usize] {
        *byte = 0xaa;
    }

    loader::relocate(&mut image, 0x5ff000).unwrap();
    assert!(image[bss_at..bss_at + bss_size as usize].iter().all(|&byte| byte == 0));
}

#[test]
fn foreign_blobs_are_rejected() {
    let mut blob = vec![0u8; 0x2000];
    assert!(loader::relocate(&mut blob, 0x100000).is_err());
}

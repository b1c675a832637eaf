//! Linking: closure, layout, GOT binding, and the relocation algebra.

mod common;

use common::ObjBuilder;
use hobgoblin::ingest::{fix_relocation_targets, ingest_bytes};
use hobgoblin::link::{LinkOptions, Linker, PAGE_SIZE, SIZEOF_GOT_ENTRY};
use hobgoblin::obj::reloc::{
    R_X86_64_64, R_X86_64_32, R_X86_64_32S, R_X86_64_GOT64, R_X86_64_GOTOFF64, R_X86_64_GOTPC64,
    R_X86_64_PC32, R_X86_64_PC64,
};
use hobgoblin::store::Store;
use hobgoblin::store::schema::SectionKind;
use scroll::Pread;

fn options(entry: &str, base: u64, recursive: bool) -> LinkOptions {
    LinkOptions {
        entrypoint: entry.into(),
        program_start_physical: base,
        program_start_virtual: base,
        recursive,
        with_symbol_names: false,
    }
}

/// Two implementations of one module: `a` defines `_start` calling `f`,
/// `b` defines `f`.
fn call_pair(store: &mut Store) {
    let mut a = ObjBuilder::new("main");
    // _start: nop*4; call f (e8 disp32); ret; padded to 16
    let mut text = vec![0x90, 0x90, 0x90, 0x90, 0xe8, 0, 0, 0, 0, 0xc3];
    text.resize(16, 0x90);
    let a_text = a.section(".text", 16, &text);
    a.func("_start", a_text, 0, 16);
    let f = a.extern_sym("f");
    a.rela(a_text, 0x5, f, R_X86_64_PC32, -4);
    ingest_bytes(store, "a", &a.build()).unwrap();

    let mut b = ObjBuilder::new("main");
    // f: mov $42, %eax; ret
    let b_text = vec![0xb8, 42, 0, 0, 0, 0xc3, 0x90, 0x90];
    let b_text_id = b.section(".text", 16, &b_text);
    b.func("f", b_text_id, 0, 6);
    ingest_bytes(store, "b", &b.build()).unwrap();

    fix_relocation_targets(store).unwrap();
}

#[test]
fn links_a_call_across_implementations() {
    let mut store = Store::in_memory();
    call_pair(&mut store);

    let linker = Linker::link(&store, options("_start", 0x200000, false)).unwrap();

    // null, GOT-self, _start, f
    assert_eq!(linker.got.len(), 4);
    assert!(linker.is_fully_resolved());
    assert_eq!(linker.modules.len(), 1);

    let module = linker.modules.values().next().unwrap();
    let text = module.section(SectionKind::Text);
    assert_eq!(text.virtual_start, 0x200000);
    assert_eq!(text.size, 16 + 8);

    // f landed where b's text begins
    let f_index = linker
        .got
        .entries()
        .iter()
        .position(|entry| entry.resolved == 1 && entry.symbol_value == 16)
        .unwrap();
    let f_entry = linker.got.entry(f_index).unwrap();
    assert_eq!(f_entry.entry_value, 0x200010);

    // the call displacement: S + A - P
    let disp: u32 = text.data.pread_with(0x5, scroll::LE).unwrap();
    let call_site = 0x200005u64;
    assert_eq!(u64::from(disp), 0x200010 - (call_site + 4));

    assert_eq!(linker.entrypoint_address_virtual, 0x200000);
    assert_eq!(linker.got_address_virtual, 0x201000);
}

#[test]
fn recursive_closure_is_order_independent() {
    let mut forward = Store::in_memory();
    let mut reverse = Store::in_memory();

    let build_app = || {
        let mut app = ObjBuilder::new("app");
        let text = app.section(".text", 16, &[0x90; 16]);
        app.func("_start", text, 0, 16);
        let f = app.extern_sym("lib_init");
        app.rela(text, 0x2, f, R_X86_64_PC32, -4);
        app.build()
    };
    let build_lib = || {
        let mut lib = ObjBuilder::new("lib");
        let text = lib.section(".text", 16, &[0xc3; 8]);
        lib.func("lib_init", text, 0, 8);
        lib.build()
    };

    ingest_bytes(&mut forward, "app", &build_app()).unwrap();
    ingest_bytes(&mut forward, "lib", &build_lib()).unwrap();
    fix_relocation_targets(&mut forward).unwrap();

    ingest_bytes(&mut reverse, "lib", &build_lib()).unwrap();
    ingest_bytes(&mut reverse, "app", &build_app()).unwrap();
    fix_relocation_targets(&mut reverse).unwrap();

    let linked_forward = Linker::link(&forward, options("_start", 0x200000, true)).unwrap();
    let linked_reverse = Linker::link(&reverse, options("_start", 0x200000, true)).unwrap();

    assert_eq!(linked_forward.got.len(), linked_reverse.got.len());
    assert!(linked_forward.is_fully_resolved());
    assert!(linked_reverse.is_fully_resolved());
    assert_eq!(
        linked_forward.entrypoint_address_virtual,
        linked_reverse.entrypoint_address_virtual
    );
    // the entry module binds first either way, so lib_init lands at the
    // same address
    let lib_init = |linker: &Linker| {
        linker
            .got
            .entries()
            .iter()
            .skip(2)
            .find(|entry| entry.entry_value != linker.entrypoint_address_virtual)
            .unwrap()
            .entry_value
    };
    assert_eq!(lib_init(&linked_forward), lib_init(&linked_reverse));
}

#[test]
fn non_recursive_leaves_foreign_modules_stubbed() {
    let mut store = Store::in_memory();
    let mut app = ObjBuilder::new("app");
    let text = app.section(".text", 16, &[0u8; 16]);
    app.func("_start", text, 0, 16);
    let missing = app.extern_sym("lib_init");
    app.rela(text, 0x2, missing, R_X86_64_64, 0);
    ingest_bytes(&mut store, "app", &app.build()).unwrap();

    let mut lib = ObjBuilder::new("lib");
    let lib_text = lib.section(".text", 16, &[0xc3; 8]);
    lib.func("lib_init", lib_text, 0, 8);
    ingest_bytes(&mut store, "lib", &lib.build()).unwrap();
    fix_relocation_targets(&mut store).unwrap();

    let linker = Linker::link(&store, options("_start", 0x200000, false)).unwrap();
    assert_eq!(linker.modules.len(), 1);
    assert_eq!(linker.got.len(), 4);
    assert!(!linker.is_fully_resolved());
    assert_eq!(linker.got.unresolved_count(), 1);

    // the stubbed slot patches to zero plus addend
    let module = linker.modules.values().next().unwrap();
    let value: u64 = module.section(SectionKind::Text).data.pread_with(0x2, scroll::LE).unwrap();
    assert_eq!(value, 0);
}

#[test]
fn section_aggregates_are_contiguous_and_aligned() {
    let mut store = Store::in_memory();
    let mut builder = ObjBuilder::new("mixed");
    let text_a = builder.section(".text.a", 16, &[0x90; 10]);
    builder.section(".text.b", 32, &[0xcc; 7]);
    builder.section(".rodata", 8, &[1, 2, 3]);
    builder.bss(".bss", 16, 100);
    builder.func("_start", text_a, 0, 10);
    ingest_bytes(&mut store, "mixed", &builder.build()).unwrap();

    let linker = Linker::link(&store, options("_start", 0x200000, false)).unwrap();
    let module = linker.modules.values().next().unwrap();

    // 10 bytes, padded to 32, then 7 more
    let text = module.section(SectionKind::Text);
    assert_eq!(text.size, 39);
    assert_eq!(text.data.len() as u64, text.size);
    assert_eq!(text.data[10..32], [0u8; 22]);
    assert_eq!(text.data[32], 0xcc);

    let rodata = module.section(SectionKind::Rodata);
    assert_eq!(rodata.size, 3);
    // layout order: text, then rodata on the next page
    assert_eq!(rodata.virtual_start, 0x201000);

    let bss = module.section(SectionKind::Bss);
    assert_eq!(bss.size, 100);
    assert!(bss.data.is_empty());
    assert_eq!(bss.virtual_start, 0x202000);

    assert_eq!(linker.got_address_virtual, 0x203000);
    assert_eq!(linker.program_size % PAGE_SIZE, 0);
}

#[test]
fn got_entries_round_trip_to_symbol_values() {
    let mut store = Store::in_memory();
    call_pair(&mut store);
    let linker = Linker::link(&store, options("_start", 0x400000, false)).unwrap();

    for entry in linker.got.entries().iter().skip(2) {
        assert_eq!(entry.resolved, 1);
        let module = &linker.modules[&entry.module_id];
        let kind = SectionKind::from_u8(entry.section_type).unwrap();
        assert_eq!(
            entry.entry_value - module.section(kind).virtual_start,
            entry.symbol_value
        );
    }
}

#[test]
fn relocation_algebra_writes_the_prescribed_values() {
    let mut store = Store::in_memory();
    let mut builder = ObjBuilder::new("algebra");
    let text = builder.section(".text", 16, &[0u8; 96]);
    let data = builder.section(".data", 8, &[0u8; 64]);
    let start = builder.func("_start", text, 0, 4);
    let target = builder.object("target", data, 8, 8);
    let got_self = builder.extern_sym("_GLOBAL_OFFSET_TABLE_");
    builder.rela(text, 0x10, target, R_X86_64_32, 4);
    builder.rela(text, 0x18, target, R_X86_64_32S, -4);
    builder.rela(text, 0x20, target, R_X86_64_64, 16);
    builder.rela(text, 0x28, target, R_X86_64_PC32, -4);
    builder.rela(text, 0x30, target, R_X86_64_PC64, 0);
    builder.rela(text, 0x38, target, R_X86_64_GOT64, 0);
    builder.rela(text, 0x40, target, R_X86_64_GOTOFF64, 0);
    builder.rela(text, 0x48, got_self, R_X86_64_GOTPC64, 0);
    let _ = start;
    ingest_bytes(&mut store, "algebra", &builder.build()).unwrap();
    fix_relocation_targets(&mut store).unwrap();

    let base = 0x200000u64;
    let linker = Linker::link(&store, options("_start", base, false)).unwrap();
    let module = linker.modules.values().next().unwrap();
    let text_data = &module.section(SectionKind::Text).data;
    let text_virt = module.section(SectionKind::Text).virtual_start;
    let data_virt = module.section(SectionKind::Data).virtual_start;
    let got = linker.got_address_virtual;

    // S: target sits 8 bytes into .data
    let s = data_virt + 8;
    let g = (linker.got.index_of_symbol_named(&store, "target") * SIZEOF_GOT_ENTRY) as u64;

    let read32 = |at: usize| -> u32 { text_data.pread_with(at, scroll::LE).unwrap() };
    let read64 = |at: usize| -> u64 { text_data.pread_with(at, scroll::LE).unwrap() };

    assert_eq!(read32(0x10), (s + 4) as u32);
    assert_eq!(read32(0x18) as i32, (s - 4) as i32);
    assert_eq!(read64(0x20), s + 16);
    assert_eq!(read32(0x28), (s.wrapping_sub(4).wrapping_sub(text_virt + 0x28)) as u32);
    assert_eq!(read64(0x30), s.wrapping_sub(text_virt + 0x30));
    assert_eq!(read64(0x38), g);
    assert_eq!(read64(0x40), s.wrapping_sub(got));
    assert_eq!(read64(0x48), got.wrapping_sub(text_virt + 0x48));
}

#[test]
fn gotpc64_against_an_ordinary_symbol_is_fatal() {
    let mut store = Store::in_memory();
    let mut builder = ObjBuilder::new("badgot");
    let text = builder.section(".text", 16, &[0u8; 32]);
    let start = builder.func("_start", text, 0, 4);
    builder.rela(text, 0x8, start, R_X86_64_GOTPC64, 0);
    ingest_bytes(&mut store, "badgot", &builder.build()).unwrap();
    fix_relocation_targets(&mut store).unwrap();

    assert!(Linker::link(&store, options("_start", 0x200000, false)).is_err());
}

#[test]
fn missing_entry_symbol_is_fatal() {
    let mut store = Store::in_memory();
    call_pair(&mut store);
    let err = Linker::link(&store, options("nonexistent", 0x200000, false)).unwrap_err();
    assert!(matches!(err, hobgoblin::Error::EntryNotFound(_)));
}

#[test]
fn duplicate_entry_definitions_link_with_the_newest() {
    let mut store = Store::in_memory();
    let make = |module: &str| {
        let mut builder = ObjBuilder::new(module);
        let text = builder.section(".text", 16, &[0x90; 8]);
        builder.func("_start", text, 0, 8);
        builder.build()
    };
    ingest_bytes(&mut store, "one", &make("one")).unwrap();
    ingest_bytes(&mut store, "two", &make("two")).unwrap();
    fix_relocation_targets(&mut store).unwrap();

    let linker = Linker::link(&store, options("_start", 0x200000, false)).unwrap();
    let newest = store.symbols.find_by_name("_start").last().unwrap().id;
    assert_eq!(linker.entrypoint_symbol_id, newest);
}

/// Test-only convenience: the GOT index of a named symbol.
trait GotIndexByName {
    fn index_of_symbol_named(&self, store: &Store, name: &str) -> usize;
}

impl GotIndexByName for hobgoblin::link::GotTable {
    fn index_of_symbol_named(&self, store: &Store, name: &str) -> usize {
        let symbol = store.symbols.find_by_name(name)[0];
        self.index_of(symbol.id).unwrap()
    }
}

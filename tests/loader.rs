//! Loader and stack-bootstrap properties over synthetic ELF32 images.

mod common;

use common::{emulator_for, Asm, ImageBuilder};
use visor::emulator::{STACK_BASE, STACK_SIZE};
use visor::loader::TCB_BASE;
use visor::ProgramImage;

const TEXT: u32 = 0x0804_8000;
const DATA: u32 = 0x0805_0000;

fn trivial_program() -> Vec<u8> {
    let mut asm = Asm::new(TEXT);
    asm.exit(0);
    asm.bytes
}

#[test]
fn image_entry_point_lands_in_eip() {
    let emulator = emulator_for(
        ImageBuilder::new().entry(TEXT).text(TEXT, trivial_program()),
        &["prog"],
    );
    assert_eq!(emulator.cpu().eip(), TEXT);
}

#[test]
fn file_backed_bytes_are_initialized_and_bss_is_not() {
    let emulator = emulator_for(
        ImageBuilder::new()
            .entry(TEXT)
            .text(TEXT, trivial_program())
            .data(DATA, b"abc".to_vec(), 0x100),
        &["prog"],
    );

    let mmu = emulator.mmu();
    assert!(mmu.read8(DATA).unwrap().is_fully_initialized());
    assert_eq!(mmu.read8(DATA + 2).unwrap().value(), b'c');
    // The BSS tail of the segment has never been written.
    assert!(mmu.read8(DATA + 3).unwrap().is_fully_uninitialized());
    assert!(mmu.read8(DATA + 0xff).unwrap().is_fully_uninitialized());
}

#[test]
fn text_regions_are_execute_only() {
    let mut emulator = emulator_for(
        ImageBuilder::new().entry(TEXT).text(TEXT, trivial_program()),
        &["prog"],
    );
    assert!(emulator.mmu().fetch8(TEXT).is_ok());
    let result = emulator
        .mmu_mut()
        .write8(TEXT, shadow::Shadow::initialized(0x90));
    assert!(matches!(
        result,
        Err(visor::mmu::Error::ProtectionViolation { .. })
    ));
}

#[test]
fn tls_segment_builds_tcb_and_pointer_cell() {
    let emulator = emulator_for(
        ImageBuilder::new()
            .entry(TEXT)
            .text(TEXT, trivial_program())
            .tls(vec![1, 2, 3, 4], 8),
        &["prog"],
    );

    let mmu = emulator.mmu();
    // The 4-byte cell at guest address zero points at the end of the TCB.
    assert_eq!(mmu.read32(0).unwrap().value(), TCB_BASE + 8);
    assert!(mmu.read32(0).unwrap().is_fully_initialized());

    assert_eq!(mmu.read8(TCB_BASE).unwrap().value(), 1);
    assert!(mmu.read8(TCB_BASE + 3).unwrap().is_fully_initialized());
    assert!(mmu.read8(TCB_BASE + 4).unwrap().is_fully_uninitialized());
}

#[test]
fn missing_allocator_symbols_abort_before_running() {
    // Build an image whose symtab carries unrelated names only.
    let bytes = ImageBuilder::new()
        .entry(TEXT)
        .text(TEXT, trivial_program())
        .build();
    let image = ProgramImage::from_bytes(&bytes).unwrap();
    // The auto-added placeholders make this image loadable; dropping down a
    // level shows the lookup itself.
    assert!(image.required_symbol_range("malloc").is_ok());
    assert!(matches!(
        image.required_symbol_range("calloc"),
        Err(visor::loader::Error::MissingSymbol("calloc"))
    ));
}

#[test]
fn garbage_is_not_an_image() {
    assert!(ProgramImage::from_bytes(b"not an elf at all").is_err());
}

#[test]
fn symbolication_resolves_containing_function() {
    let bytes = ImageBuilder::new()
        .entry(TEXT)
        .text(TEXT, trivial_program())
        .symbol("main", TEXT, 0x20)
        .build();
    let image = ProgramImage::from_bytes(&bytes).unwrap();
    assert_eq!(image.symbolicate(TEXT + 5), Some(("main", 5)));
    assert_eq!(image.symbolicate(TEXT + 0x20), None);
}

#[test]
fn stack_bootstrap_frame_layout() {
    let emulator = emulator_for(
        ImageBuilder::new().entry(TEXT).text(TEXT, trivial_program()),
        &["prog", "hello", "world"],
    );

    let mmu = emulator.mmu();
    let esp = emulator.cpu().esp().value();
    let in_stack = |addr: u32| addr >= STACK_BASE && addr < STACK_BASE + STACK_SIZE;
    assert!(in_stack(esp));

    // Frame top-down: alignment word, argc, argv, envp, alignment word.
    assert_eq!(mmu.read32(esp).unwrap().value(), 0);
    let argc = mmu.read32(esp + 4).unwrap().value();
    let argv = mmu.read32(esp + 8).unwrap().value();
    let envp = mmu.read32(esp + 12).unwrap().value();
    assert_eq!(argc, 3);

    let expected = ["prog", "hello", "world"];
    for (i, expected) in expected.iter().enumerate() {
        let entry = mmu.read32(argv + 4 * i as u32).unwrap();
        assert!(entry.is_fully_initialized());
        assert!(in_stack(entry.value()));
        let string = mmu.read_cstring_from_vm(entry.value(), 256).unwrap();
        assert_eq!(string, expected.as_bytes());
    }
    // argv[argc] terminates the array.
    assert_eq!(mmu.read32(argv + 4 * argc).unwrap().value(), 0);

    // No environment was passed; envp is just its terminator.
    assert_eq!(mmu.read32(envp).unwrap().value(), 0);
}

#[test]
fn environment_strings_are_reachable() {
    let bytes = ImageBuilder::new()
        .entry(TEXT)
        .text(TEXT, trivial_program())
        .build();
    let image = ProgramImage::from_bytes(&bytes).unwrap();
    let emulator = visor::Emulator::new(
        image,
        &["prog".to_string()],
        &["HOME=/home/test".to_string(), "TERM=dumb".to_string()],
    )
    .unwrap();

    let mmu = emulator.mmu();
    let esp = emulator.cpu().esp().value();
    let envp = mmu.read32(esp + 12).unwrap().value();

    let first = mmu.read32(envp).unwrap().value();
    let second = mmu.read32(envp + 4).unwrap().value();
    assert_eq!(
        mmu.read_cstring_from_vm(first, 256).unwrap(),
        b"HOME=/home/test"
    );
    assert_eq!(mmu.read_cstring_from_vm(second, 256).unwrap(), b"TERM=dumb");
    assert_eq!(mmu.read32(envp + 8).unwrap().value(), 0);
}

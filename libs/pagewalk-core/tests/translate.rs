mod common;

use common::{FLAGS, chain};
use pagewalk_core::emulate::{EmulatedMemory, FixedControlRegister};
use pagewalk_core::{
    ControlRegisterSource, DumpFilter, PhysicalAddress, Transcript, VirtualAddress, Walker,
};

#[test_log::test]
fn single_resolution() {
    let mut mem = EmulatedMemory::new();
    let top = PhysicalAddress::new(0x1000);
    let virt = VirtualAddress::new(0x401000);

    // indices 0, 0, 2, 1 and offset 0
    let parts = virt.decompose();
    assert_eq!(parts.indices(), [0, 0, 2, 1]);
    assert_eq!(parts.page_offset(), 0);

    let bases = chain(&mut mem, top, virt, PhysicalAddress::new(0x9000), FLAGS);

    let mut cr3 = FixedControlRegister(top);
    let mut walker = Walker::new(mem);
    let translation = walker
        .translate(cr3.top_level_table().unwrap(), virt, ())
        .unwrap();

    let visited: Vec<_> = translation.steps().iter().map(|step| step.table).collect();
    assert_eq!(visited, bases);
    assert_eq!(translation.frame(), PhysicalAddress::new(0x9000));
    assert_eq!(translation.physical_address(), PhysicalAddress::new(0x9000));
}

#[test_log::test]
fn round_trip_adds_page_offset() {
    let mut mem = EmulatedMemory::new();
    let top = PhysicalAddress::new(0x20_0000);
    let frame = PhysicalAddress::new(0x1_2345_6000);

    for virt in [0x7ffe_1c3a_5abc, 0x0000_7fff_ffff_ffff, 0x1000, 0xfff] {
        let virt = VirtualAddress::new(virt);
        let mut mem = EmulatedMemory::new();
        chain(&mut mem, top, virt, frame, FLAGS);

        let mut walker = Walker::new(&mut mem);
        let translation = walker.translate(top, virt, ()).unwrap();
        assert_eq!(
            translation.physical_address(),
            frame.wrapping_add(virt.get() & 0xfff),
            "{virt}"
        );
    }

    // with every table empty the walk follows the zero entries down to frame 0
    mem.zero_frame(top);
    mem.zero_frame(PhysicalAddress::new(0));
    let mut walker = Walker::new(mem);
    let translation = walker
        .translate(top, VirtualAddress::new(0x1234), ())
        .unwrap();
    assert!(translation.is_speculative());
    assert_eq!(translation.physical_address(), PhysicalAddress::new(0x234));
}

#[test_log::test]
fn repeated_translations_are_identical() {
    let mut mem = EmulatedMemory::new();
    let top = PhysicalAddress::new(0x1000);
    let virt = VirtualAddress::new(0x7f12_3456_7890);
    chain(&mut mem, top, virt, PhysicalAddress::new(0xabc_d000), FLAGS);

    let mut walker = Walker::new(mem);
    let mut first = Transcript::new("buff", DumpFilter::NonZero);
    let mut second = Transcript::new("buff", DumpFilter::NonZero);

    let a = walker.translate(top, virt, &mut first).unwrap();
    let b = walker.translate(top, virt, &mut second).unwrap();

    assert_eq!(a.physical_address(), b.physical_address());
    assert_eq!(a.steps(), b.steps());
    assert_eq!(first.as_str(), second.as_str());

    // every translation reads all four tables again
    assert_eq!(walker.reader().reads(), 8);
}

#[test_log::test]
fn changes_between_translations_are_observed() {
    let mut mem = EmulatedMemory::new();
    let top = PhysicalAddress::new(0x1000);
    let virt = VirtualAddress::new(0x401000);
    let bases = chain(&mut mem, top, virt, PhysicalAddress::new(0x9000), FLAGS);

    let mut walker = Walker::new(mem);
    let before = walker.translate(top, virt, ()).unwrap();

    walker.reader_mut().write_entry(bases[3], 1, 0xa000 | FLAGS);
    let after = walker.translate(top, virt, ()).unwrap();

    assert_eq!(before.physical_address(), PhysicalAddress::new(0x9000));
    assert_eq!(after.physical_address(), PhysicalAddress::new(0xa000));
}

#[test_log::test]
fn not_present_entries_are_followed() {
    let mut mem = EmulatedMemory::new();
    let top = PhysicalAddress::new(0x1000);
    let virt = VirtualAddress::new(0x401000);
    let bases = chain(&mut mem, top, virt, PhysicalAddress::new(0x9000), FLAGS);

    // clear the present bit of the PD entry, keeping its frame bits
    mem.write_entry(bases[2], 2, bases[3].get() | (FLAGS & !1));

    let mut walker = Walker::new(mem);
    let mut transcript = Transcript::new("buff", DumpFilter::Present);
    let translation = walker.translate(top, virt, &mut transcript).unwrap();

    assert!(translation.is_speculative());
    assert!(translation.steps()[2].descends_through_not_present());
    assert_eq!(translation.physical_address(), PhysicalAddress::new(0x9000));

    let out = transcript.take();
    assert!(out.contains("Got PTE 0000000000004066 (not present)\n"), "{out}");
}

mod common;

use common::{FLAGS, chain};
use pagewalk_core::emulate::EmulatedMemory;
use pagewalk_core::procfs::PhysicalMemoryFile;
use pagewalk_core::{DumpFilter, Error, PhysicalAddress, Transcript, VirtualAddress, Walker};

fn walk_with_limit(limit: usize) -> (Result<PhysicalAddress, Error>, String) {
    let mut mem = EmulatedMemory::new();
    let top = PhysicalAddress::new(0x1000);
    let virt = VirtualAddress::new(0x401000);
    let bases = chain(&mut mem, top, virt, PhysicalAddress::new(0x9000), FLAGS);
    mem.limit_reads(bases[1], limit);

    let mut walker = Walker::new(mem);
    let mut transcript = Transcript::new("buff", DumpFilter::Present);
    let result = walker
        .translate(top, virt, &mut transcript)
        .map(|translation| translation.physical_address());

    (result, transcript.take())
}

#[test_log::test]
fn zero_byte_read() {
    let (result, out) = walk_with_limit(0);

    let err = result.unwrap_err();
    assert!(
        matches!(
            err,
            Error::PartialTableRead {
                level: "PDPT",
                read: 0,
                ..
            }
        ),
        "{err:?}"
    );
    assert!(!err.is_fatal());
    assert!(out.contains("Got 0 reading 0000000000002000\n"), "{out}");
    assert!(out.ends_with(
        "buff(): virt 0000000000401000 -> phys 0000000000000000 (unresolved)\n------------------\n"
    ));
}

#[test_log::test]
fn one_byte_short() {
    let (result, out) = walk_with_limit(4095);

    assert!(matches!(
        result,
        Err(Error::PartialTableRead { read: 4095, .. })
    ));
    assert!(out.contains("Got 4095 reading 0000000000002000\n"), "{out}");
    // the incomplete table is never dumped
    assert!(!out.contains("PAGE TABLE for 0000000000002000"));
}

#[test_log::test]
fn next_translation_still_succeeds() {
    let mut mem = EmulatedMemory::new();
    let top = PhysicalAddress::new(0x1000);
    let good = VirtualAddress::new(0x401000);
    chain(&mut mem, top, good, PhysicalAddress::new(0x9000), FLAGS);

    // points at a PDPT frame that is not backed
    mem.write_entry(top, 1, 0x7_0000 | FLAGS);
    let bad = VirtualAddress::new(1 << 39);

    let mut walker = Walker::new(mem);
    assert!(walker.translate(top, bad, ()).is_err());
    assert_eq!(
        walker.translate(top, good, ()).unwrap().physical_address(),
        PhysicalAddress::new(0x9000)
    );
}

#[test_log::test]
fn file_backed_short_read() {
    // physical memory that ends in the middle of the PDPT table
    let mut data = vec![0u8; 0x2800];
    data[0x1000..0x1008].copy_from_slice(&(0x2000u64 | FLAGS).to_le_bytes());

    let mut walker = Walker::new(PhysicalMemoryFile::new(data));
    let err = walker
        .translate(PhysicalAddress::new(0x1000), VirtualAddress::new(0), ())
        .unwrap_err();

    assert!(matches!(err, Error::PartialTableRead { read: 0x800, .. }));
}

use pagewalk_core::emulate::EmulatedMachine;
use pagewalk_core::{ControlRegisterSource, DumpFilter, Transcript, VirtualAddress, Walker};

#[test_log::test]
fn fork_then_write() {
    let mut machine = EmulatedMachine::default();
    let mut parent = machine.new_address_space();
    let data = VirtualAddress::new(0x7f00_1234_5000);

    machine.map(parent, data);
    machine.write(parent, data, b"original data");

    let orig = Walker::new(&mut machine)
        .translate(parent.top_level_table().unwrap(), data, ())
        .unwrap();

    let mut child = machine.fork(parent);
    assert_ne!(
        parent.top_level_table().unwrap(),
        child.top_level_table().unwrap()
    );

    // before the write both branches translate to the same frame
    let mut transcript = Transcript::new("child", DumpFilter::NonZero);
    let shared_parent = Walker::new(&mut machine)
        .translate(parent.top_level_table().unwrap(), data, ())
        .unwrap();
    let shared_child = Walker::new(&mut machine)
        .translate(child.top_level_table().unwrap(), data, &mut transcript)
        .unwrap();
    assert_eq!(shared_parent.physical_address(), orig.physical_address());
    assert_eq!(shared_child.physical_address(), orig.physical_address());

    // the shared leaf entry is write protected, which shows up in the dump
    let out = transcript.take();
    assert!(out.contains(" P - U A D -\n"), "{out}");

    machine.write(child, data, b"new data");

    let written_child = Walker::new(&mut machine)
        .translate(child.top_level_table().unwrap(), data, ())
        .unwrap();
    let written_parent = Walker::new(&mut machine)
        .translate(parent.top_level_table().unwrap(), data, ())
        .unwrap();

    assert_ne!(written_child.physical_address(), orig.physical_address());
    assert_eq!(written_parent.physical_address(), orig.physical_address());

    assert_eq!(machine.read(child, data, 8), b"new data");
    assert_eq!(machine.read(parent, data, 13), b"original data");
    assert_eq!(
        machine
            .memory()
            .read_bytes(written_child.physical_address(), 8),
        b"new data"
    );
    assert_eq!(
        machine
            .memory()
            .read_bytes(orig.physical_address(), 13),
        b"original data"
    );
}

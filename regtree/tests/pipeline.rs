//! Whole-tree scenarios over a threaded memory emulator.

use std::sync::{Arc, Mutex};

use regtree::{
    Device, DeviceNode, EmulatorConfig, Master, MemoryDevice, MemoryEmulator, Mode, Model, Phase,
    RegError, Root, TransportError, TxnKind, Value, VariableBuilder,
};

fn threaded_emulator(max_access: usize) -> Arc<MemoryEmulator> {
    MemoryEmulator::new(EmulatorConfig {
        max_access,
        threaded: true,
        latency_ms: 1,
        ..Default::default()
    })
}

fn build_tree(emu: &Arc<MemoryEmulator>) -> (Arc<Root>, Arc<MemoryDevice>) {
    let root = Root::new("top").unwrap();
    root.set_master(Master::new(emu.clone()));

    let ctrl = Device::new("ctrl", "Control registers", 0x1000).unwrap();
    ctrl.add_variable(
        VariableBuilder::new("mode", Model::uint(4).unwrap())
            .offset(0x0)
            .enum_entry(0u8, "Off")
            .enum_entry(1u8, "Run"),
    )
    .unwrap();
    ctrl.add_variable(
        VariableBuilder::new("gain", Model::int(12).unwrap())
            .offset(0x0)
            .bit_offset(4),
    )
    .unwrap();
    ctrl.add_variable(
        VariableBuilder::new("status", Model::uint(16).unwrap())
            .offset(0x0)
            .bit_offset(16)
            .mode(Mode::RO)
            .poll(true),
    )
    .unwrap();
    ctrl.add_variable(
        VariableBuilder::new("scale", Model::float().unwrap())
            .offset(0x4)
            .value(1.5f32),
    )
    .unwrap();
    root.add_device(ctrl).unwrap();

    let mem = MemoryDevice::new("mem", 0x2000, 0x400, Model::uint(32).unwrap(), 4, true).unwrap();
    root.add_device(mem.clone()).unwrap();

    (root, mem)
}

fn variable(root: &Root, path: &str) -> Arc<regtree::Variable> {
    root.get_node(path)
        .and_then(|n| n.as_variable().cloned())
        .unwrap()
}

#[test]
fn shared_word_fields_round_trip() {
    let emu = threaded_emulator(4096);
    let (root, _) = build_tree(&emu);

    root.set_variables([("ctrl.mode", "Run"), ("ctrl.gain", "-3")], &[Mode::RW])
        .unwrap();

    // mode = 1 in bits 0..4, gain = -3 (0xFFD) in bits 4..16
    assert_eq!(emu.peek(0x1000, 2), vec![0xD1, 0xFF]);
    assert_eq!(emu.peek(0x1004, 4), 1.5f32.to_le_bytes().to_vec());

    emu.poke(0x1002, &[0x34, 0x12]);
    root.read_all().unwrap();
    assert_eq!(variable(&root, "ctrl.status").raw_get().unwrap(), Value::UInt(0x1234));
    assert_eq!(variable(&root, "ctrl.gain").get().unwrap(), Value::Int(-3));
    assert_eq!(variable(&root, "ctrl.mode").get_display().unwrap(), "Run");
}

#[test]
fn bulk_write_verify_check() {
    let emu = threaded_emulator(8);
    let (root, mem) = build_tree(&emu);

    mem.stage([(0x100, "1, 2, 3, 4, 5")]).unwrap();
    root.write_all().unwrap();
    assert_eq!(mem.phase(), Phase::Checked);

    let writes: Vec<(u64, usize)> = emu
        .history()
        .iter()
        .filter(|r| r.kind == TxnKind::Write && r.address >= 0x2000)
        .map(|r| (r.address, r.size))
        .collect();
    assert_eq!(writes, vec![(0x2100, 8), (0x2108, 8), (0x2110, 4)]);

    assert_eq!(
        mem.read_values(0x108, 3).unwrap(),
        vec![Value::UInt(3), Value::UInt(4), Value::UInt(5)]
    );
}

#[test]
fn verify_mismatch_is_logged_and_cleared() {
    let emu = threaded_emulator(4096);
    let (root, mem) = build_tree(&emu);
    emu.override_read(0x2010, &[6]);

    mem.stage([(0x10, "5")]).unwrap();
    let err = root.write_all().unwrap_err();
    match &err {
        RegError::Verify { name, address, .. } => {
            assert_eq!(name, "top.mem");
            assert_eq!(*address, 0x2010);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(err.transport_error(), Some(TransportError::Verify));
    assert!(root.log().render().contains("Offset 0x10"));

    // Nothing left to re-raise
    root.write_all().unwrap();
    mem.check_blocks().unwrap();
}

#[test]
fn disabled_memory_keeps_staged_values() {
    let emu = threaded_emulator(4096);
    let (root, mem) = build_tree(&emu);

    root.set_variables([("mem.enable", "False")], &[Mode::RW]).unwrap();
    mem.stage([(0x0, "9")]).unwrap();
    emu.clear_history();

    root.write_all().unwrap();
    assert!(emu.history().iter().all(|r| r.address < 0x2000));
    assert_eq!(mem.phase(), Phase::Staged);

    variable(&root, "mem.enable").set(true).unwrap();
    root.write_all().unwrap();
    assert_eq!(emu.peek(0x2000, 4), vec![9, 0, 0, 0]);
}

#[test]
fn listeners_see_batched_updates() {
    let emu = threaded_emulator(4096);
    let (root, _) = build_tree(&emu);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    root.add_listener(move |path, _, display| {
        sink.lock().unwrap().push(format!("{} = {}", path, display));
    });

    emu.poke(0x1000, &[0x01, 0x00, 0xCD, 0xAB]);
    root.poll_once().unwrap();

    let seen = seen.lock().unwrap().clone();
    assert!(seen.contains(&"top.ctrl.status = 0xabcd".to_string()));
    assert!(seen.contains(&"top.ctrl.mode = Run".to_string()));
    assert!(!seen.iter().any(|s| s.starts_with("top.ctrl.scale")));
}

#[test]
fn bus_error_surfaces_on_check_only() {
    let emu = threaded_emulator(4096);
    let (root, _) = build_tree(&emu);
    emu.fail_at(0x1004, TransportError::BusTimeout);

    let ctrl = root.get_node("ctrl").and_then(|n| n.as_device().cloned()).unwrap();
    ctrl.read_blocks().unwrap();
    let err = ctrl.check_blocks().unwrap_err();
    assert_eq!(
        err,
        RegError::Memory {
            name: "top.ctrl".to_string(),
            address: 0x1004,
            size: 4,
            error: TransportError::BusTimeout,
        }
    );
    ctrl.check_blocks().unwrap();
}

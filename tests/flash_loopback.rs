//! End-to-end flash runs against the scripted in-process device.

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use sindri::application::flasher::{flash, FlashConfig, Target, UiHooks};
use sindri::application::planner::{expand_inputs, ImageSpec};
use sindri::domain::pit::{self, Partition, PitTable};
use sindri::infrastructure::odin::commands::OdinLink;
use sindri::infrastructure::odin::pit_transfer::download_pit_bytes;
use sindri::infrastructure::transport::mock::ScriptedDevice;

const ONE_MIB: usize = 1024 * 1024;

fn part(id: i32, dev_type: i32, begin: i32, blocks: i32, name: &str, file: &str) -> Partition {
    let block_bytes = if dev_type == 8 { 4096 } else { 512 };
    Partition {
        id,
        dev_type,
        begin_block: begin,
        block_bytes,
        block_size: blocks,
        file_size: block_bytes as u64 * blocks as u64,
        name: name.to_string(),
        file_name: file.to_string(),
    }
}

fn device_pit() -> PitTable {
    PitTable {
        com_tar2: String::new(),
        cpu_bl_id: "EXYNOS".into(),
        lu_count: 1,
        partitions: vec![
            part(10, 8, 0, 8192, "BOOT", "boot.img"),
            part(20, 8, 8192, 16384, "USERDATA", "userdata.img"),
        ],
    }
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 249) as u8).collect()
}

fn write_input(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> PathBuf {
    let p = dir.path().join(name);
    let mut f = std::fs::File::create(&p).unwrap();
    f.write_all(data).unwrap();
    f.flush().unwrap();
    p
}

/// Standard LZ4 frame in the profile the engine accepts: BD6,
/// content size present, independent 1 MiB blocks.
fn lz4_frame(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&[0x04, 0x22, 0x4D, 0x18]);
    out.push(0b0110_1000);
    out.push(6 << 4);
    out.extend_from_slice(&(data.len() as u64).to_le_bytes());
    out.push(0);

    for chunk in data.chunks(ONE_MIB) {
        let comp = lz4_flex::block::compress(chunk);
        if comp.len() < chunk.len() {
            out.extend_from_slice(&(comp.len() as u32).to_le_bytes());
            out.extend_from_slice(&comp);
        } else {
            out.extend_from_slice(&(chunk.len() as u32 | 0x8000_0000).to_le_bytes());
            out.extend_from_slice(chunk);
        }
    }
    out.extend_from_slice(&0u32.to_le_bytes());
    out
}

struct Recorder {
    errors: Arc<Mutex<Vec<String>>>,
    last_progress: Arc<Mutex<(u64, u64)>>,
    done_items: Arc<Mutex<Vec<usize>>>,
}

fn recording_hooks() -> (UiHooks, Recorder) {
    let rec = Recorder {
        errors: Arc::new(Mutex::new(Vec::new())),
        last_progress: Arc::new(Mutex::new((0, 0))),
        done_items: Arc::new(Mutex::new(Vec::new())),
    };

    let mut hooks = UiHooks::default();
    {
        let errors = Arc::clone(&rec.errors);
        hooks.on_error = Some(Box::new(move |m| errors.lock().unwrap().push(m.to_string())));
    }
    {
        let lp = Arc::clone(&rec.last_progress);
        hooks.on_progress = Some(Box::new(move |od, ot, _, _| {
            *lp.lock().unwrap() = (od, ot);
        }));
    }
    {
        let di = Arc::clone(&rec.done_items);
        hooks.on_item_done = Some(Box::new(move |i| di.lock().unwrap().push(i)));
    }

    (hooks, rec)
}

fn expand(dir: &tempfile::TempDir, names: &[&str]) -> Vec<ImageSpec> {
    let paths: Vec<PathBuf> = names.iter().map(|n| dir.path().join(n)).collect();
    expand_inputs(&paths).unwrap()
}

#[test]
fn single_device_raw_image() {
    let dir = tempfile::tempdir().unwrap();
    let data = patterned(3 * ONE_MIB + 12345);
    write_input(&dir, "boot.img", &data);

    let dev = ScriptedDevice::new(3, false, pit::synthesize(&device_pit()));
    let mut targets = [Target::new("dev0", Box::new(dev.transport()))];

    let specs = expand(&dir, &["boot.img"]);
    let (hooks, rec) = recording_hooks();

    flash(&mut targets, &specs, None, &FlashConfig::default(), &hooks).unwrap();

    dev.with_state(|s| {
        // All v2+: 1 MiB packets negotiated, logical total announced.
        assert_eq!(s.total_size, data.len() as u64);
        assert_eq!(s.flashed[&10], data);

        assert_eq!(s.windows.len(), 1);
        let w = &s.windows[0];
        assert_eq!(w.part_id, 10);
        assert_eq!(w.dev_type, 8);
        assert_eq!(w.size_to_flash as usize, data.len());
        assert!(w.is_last);
        assert!(!w.compressed);

        // CLOSE/END then CLOSE/REBOOT (default reboot-after-flash).
        assert_eq!(s.close_params, vec![0, 1]);
    });

    assert!(rec.errors.lock().unwrap().is_empty());
    assert_eq!(
        *rec.last_progress.lock().unwrap(),
        (data.len() as u64, data.len() as u64)
    );
    assert_eq!(*rec.done_items.lock().unwrap(), vec![0]);
}

#[test]
fn two_devices_receive_identical_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let data = patterned(2 * ONE_MIB + 999);
    write_input(&dir, "boot.img", &data);

    let pit_bytes = pit::synthesize(&device_pit());
    let dev_a = ScriptedDevice::new(3, false, pit_bytes.clone());
    let dev_b = ScriptedDevice::new(3, false, pit_bytes);

    let mut targets = [
        Target::new("dev0", Box::new(dev_a.transport())),
        Target::new("dev1", Box::new(dev_b.transport())),
    ];

    let specs = expand(&dir, &["boot.img"]);
    let (hooks, rec) = recording_hooks();

    flash(&mut targets, &specs, None, &FlashConfig::default(), &hooks).unwrap();

    let wire_a = dev_a.with_state(|s| s.wire_in.clone());
    let wire_b = dev_b.with_state(|s| s.wire_in.clone());
    assert_eq!(wire_a, wire_b, "lock-step delivery must be byte-identical");

    dev_a.with_state(|s| assert_eq!(s.flashed[&10], data));
    dev_b.with_state(|s| assert_eq!(s.flashed[&10], data));
    assert!(rec.errors.lock().unwrap().is_empty());
}

#[test]
fn failed_device_is_dropped_and_run_continues() {
    let dir = tempfile::tempdir().unwrap();
    let boot = patterned(ONE_MIB + 100);
    let userdata = patterned(ONE_MIB / 2);
    write_input(&dir, "boot.img", &boot);
    write_input(&dir, "userdata.img", &userdata);

    let pit_bytes = pit::synthesize(&device_pit());
    let dev_a = ScriptedDevice::new(3, false, pit_bytes.clone());
    let dev_b = ScriptedDevice::new(3, false, pit_bytes);
    // Die on the second item's first window.
    dev_b.fail_on_window(2);

    let mut targets = [
        Target::new("dev0", Box::new(dev_a.transport())),
        Target::new("dev1", Box::new(dev_b.transport())),
    ];

    let specs = expand(&dir, &["boot.img", "userdata.img"]);
    let (hooks, rec) = recording_hooks();

    let err = flash(&mut targets, &specs, None, &FlashConfig::default(), &hooks).unwrap_err();
    assert_eq!(err.exit_code(), 1);

    // The healthy device finished both items and was shut down.
    dev_a.with_state(|s| {
        assert_eq!(s.flashed[&10], boot);
        assert_eq!(s.flashed[&20], userdata);
        assert_eq!(s.close_params, vec![0, 1]);
    });

    // The dead device never saw the second partition nor a shutdown.
    dev_b.with_state(|s| {
        assert_eq!(s.flashed[&10], boot);
        assert!(!s.flashed.contains_key(&20));
        assert!(s.close_params.is_empty());
    });

    let errors = rec.errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("DEVFAIL idx=1 "), "{}", errors[0]);

    // Both items still completed for the surviving device.
    assert_eq!(*rec.done_items.lock().unwrap(), vec![0, 1]);
}

#[test]
fn compressed_download_windows() {
    let dir = tempfile::tempdir().unwrap();
    let data = patterned(2 * ONE_MIB + ONE_MIB / 2);
    write_input(&dir, "userdata.img.lz4", &lz4_frame(&data));

    let dev = ScriptedDevice::new(5, true, pit::synthesize(&device_pit()));
    let mut targets = [Target::new("dev0", Box::new(dev.transport()))];

    let specs = expand(&dir, &["userdata.img.lz4"]);
    assert!(specs[0].lz4);
    assert_eq!(specs[0].basename, "userdata.img");
    assert_eq!(specs[0].size, data.len() as u64);

    // Two-block windows: one non-final 2 MiB window, then the tail.
    let cfg = FlashConfig {
        buffer_bytes: 2 * ONE_MIB as u64,
        ..FlashConfig::default()
    };

    let (hooks, rec) = recording_hooks();
    flash(&mut targets, &specs, None, &cfg, &hooks).unwrap();

    dev.with_state(|s| {
        assert_eq!(s.flashed[&20], data);
        assert_eq!(s.windows.len(), 2);
        assert!(s.windows.iter().all(|w| w.compressed && w.part_id == 20));
        assert_eq!(s.windows[0].size_to_flash as usize, 2 * ONE_MIB);
        assert!(!s.windows[0].is_last);
        assert_eq!(s.windows[1].size_to_flash as usize, ONE_MIB / 2);
        assert!(s.windows[1].is_last);
        assert_eq!(s.total_size, data.len() as u64);
    });

    // Progress is decompressed-byte-accurate: 2,621,440 bytes.
    assert_eq!(
        *rec.last_progress.lock().unwrap(),
        (data.len() as u64, data.len() as u64)
    );
}

#[test]
fn lz4_falls_back_to_plain_without_device_support() {
    let dir = tempfile::tempdir().unwrap();
    let data = patterned(ONE_MIB + 77);
    write_input(&dir, "userdata.img.lz4", &lz4_frame(&data));

    let dev = ScriptedDevice::new(3, false, pit::synthesize(&device_pit()));
    let mut targets = [Target::new("dev0", Box::new(dev.transport()))];

    let specs = expand(&dir, &["userdata.img.lz4"]);
    let (hooks, _rec) = recording_hooks();
    flash(&mut targets, &specs, None, &FlashConfig::default(), &hooks).unwrap();

    dev.with_state(|s| {
        // Host-side decompression, plain windows on the wire.
        assert!(s.windows.iter().all(|w| !w.compressed));
        assert_eq!(s.flashed[&20], data);
    });
}

#[test]
fn pit_round_trip_over_wire() {
    let table = device_pit();
    let dev = ScriptedDevice::new(3, false, pit::synthesize(&table));
    let mut t = dev.transport();

    let mut odin = OdinLink::new(&mut t);
    odin.handshake(0).unwrap();
    odin.get_version(0).unwrap();

    let bytes = download_pit_bytes(&mut odin, 0).unwrap();
    let parsed = pit::parse(&bytes).unwrap();
    assert_eq!(parsed, table);

    let boot = parsed.find_by_file_name("boot.img").unwrap();
    assert_eq!(boot.id, 10);
    assert_eq!(boot.dev_type, 8);
}

#[test]
fn pit_upload_only_run() {
    let dev = ScriptedDevice::new(3, false, pit::synthesize(&device_pit()));
    let mut targets = [Target::new("dev0", Box::new(dev.transport()))];

    let pit_bytes = Arc::new(pit::synthesize(&device_pit()));
    let (hooks, rec) = recording_hooks();

    flash(
        &mut targets,
        &[],
        Some(Arc::clone(&pit_bytes)),
        &FlashConfig::default(),
        &hooks,
    )
    .unwrap();

    dev.with_state(|s| {
        assert_eq!(s.uploaded_pit.as_deref(), Some(&pit_bytes[..]));
        assert_eq!(s.close_params, vec![0, 1]);
    });
    assert!(rec.errors.lock().unwrap().is_empty());
}

#[test]
fn reboot_only_run() {
    let dev = ScriptedDevice::new(3, false, Vec::new());
    let mut targets = [Target::new("dev0", Box::new(dev.transport()))];

    let (hooks, _rec) = recording_hooks();
    flash(&mut targets, &[], None, &FlashConfig::default(), &hooks).unwrap();

    dev.with_state(|s| {
        // No PIT traffic, no payload: just END + REBOOT.
        assert!(s.flashed.is_empty());
        assert_eq!(s.close_params, vec![0, 1]);
    });
}

#[test]
fn cpu_bl_id_mismatch_fails_the_group() {
    let dir = tempfile::tempdir().unwrap();
    write_input(&dir, "boot.img", &patterned(1024));

    let mut other = device_pit();
    other.cpu_bl_id = "SNAPDRAGON".into();

    let dev_a = ScriptedDevice::new(3, false, pit::synthesize(&device_pit()));
    let dev_b = ScriptedDevice::new(3, false, pit::synthesize(&other));

    let mut targets = [
        Target::new("dev0", Box::new(dev_a.transport())),
        Target::new("dev1", Box::new(dev_b.transport())),
    ];

    let specs = expand(&dir, &["boot.img"]);
    let (hooks, _rec) = recording_hooks();
    let err = flash(&mut targets, &specs, None, &FlashConfig::default(), &hooks).unwrap_err();
    assert!(matches!(err, sindri::Error::Mapping(_)));

    // Nothing was flashed anywhere.
    dev_a.with_state(|s| assert!(s.flashed.is_empty()));
    dev_b.with_state(|s| assert!(s.flashed.is_empty()));
}

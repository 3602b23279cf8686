//! CLI Presentation Module
//!
//! Dispatches the validated options onto the engine: device listing,
//! PIT operations, reboot, and full flash runs over USB or TCP.

pub mod args;

use std::path::Path;
use std::sync::Arc;

use log::{error, info};

use crate::application::flasher::{self, FlashConfig, Target, UiHooks};
use crate::application::md5_check;
use crate::application::planner::{self, ImageSpec};
use crate::domain::pit::{self, PitTable};
use crate::error::{Error, Result, EXIT_NO_DEVICES, EXIT_NO_FLASH_FILES};
use crate::infrastructure::odin::commands::OdinLink;
use crate::infrastructure::odin::pit_transfer::download_pit_bytes;
use crate::infrastructure::odin::ShutdownMode;
use crate::infrastructure::platform::{SignalShield, SingleInstanceLock};
use crate::infrastructure::transport::tcp::WirelessListener;
use crate::infrastructure::transport::Transport;
use crate::infrastructure::usb::{DeviceEnumerator, NusbEnumerator, UsbDeviceInfo};
use crate::presentation::progress;

use args::{Args, Options};

const LOCK_NAME: &str = "sindri-engine";

/// Entry point: validate, dispatch, map errors to exit codes.
pub fn execute(args: Args) -> i32 {
    let opt = match args::validate(args) {
        Ok(o) => o,
        Err(e) => {
            error!("{e}");
            return e.exit_code();
        }
    };

    let run = if opt.wireless {
        run_wireless(&opt)
    } else {
        run_usb(&opt)
    };

    match run {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    }
}

fn read_file(p: &Path) -> Result<Vec<u8>> {
    Ok(std::fs::read(p)?)
}

fn print_pit_table(t: &PitTable) {
    let d = |s: &str| if s.is_empty() { "-".to_string() } else { s.to_string() };

    info!("PIT TABLE");
    info!("cpu_bl_id: {}", d(&t.cpu_bl_id));
    info!("com_tar2:  {}", d(&t.com_tar2));
    info!("lu_count:  {}", t.lu_count);
    info!("entries:   {}", t.partitions.len());
    info!("------------------------------------------------------------");

    for (i, p) in t.partitions.iter().enumerate() {
        info!("Partition #{i}:");
        info!("id: {}", p.id);
        info!("dev_type: {}", p.dev_type);
        info!("block_count: {}", p.block_size);
        info!("block_size: {}", p.block_bytes);
        info!("file_size: {}", p.file_size);
        info!("name: {}", d(&p.name));
        info!("file_name: {}", d(&p.file_name));
        info!("------------------------------------------------------------");
    }
}

fn flash_config(opt: &Options) -> FlashConfig {
    FlashConfig {
        reboot_after: opt.reboot_after_flash,
        redownload_after: opt.redownload,
        ..FlashConfig::default()
    }
}

fn final_shutdown_mode(opt: &Options) -> ShutdownMode {
    if opt.redownload {
        ShutdownMode::ReDownload
    } else if opt.reboot_after_flash {
        ShutdownMode::Reboot
    } else {
        ShutdownMode::NoReboot
    }
}

/// Handshake + version at the pre-flash timeout, then run `f` at the
/// flash timeout.
fn with_odin<R>(
    link: &mut dyn Transport,
    cfg: &FlashConfig,
    f: impl FnOnce(&mut OdinLink<'_>) -> Result<R>,
) -> Result<R> {
    link.set_timeout(cfg.preflash_timeout);
    let mut odin = OdinLink::new(&mut *link);
    odin.handshake(cfg.preflash_retries)?;
    odin.get_version(cfg.preflash_retries)?;
    drop(odin);

    link.set_timeout(cfg.flash_timeout);
    let mut odin = OdinLink::new(&mut *link);
    f(&mut odin)
}

fn select_target(enumerator: &dyn DeviceEnumerator, sysname: &str) -> Result<UsbDeviceInfo> {
    use crate::infrastructure::usb::{ODIN_PIDS, SAMSUNG_VID};

    let Some(info) = enumerator.find_by_sysname(sysname)? else {
        return Err(Error::DeviceGone(format!(
            "no device found with sysname: {sysname}"
        )));
    };

    if info.vendor != SAMSUNG_VID {
        return Err(Error::DeviceGone(format!(
            "device {} has wrong VID: expected 0x{:04x}, got 0x{:04x}",
            info.sysname, SAMSUNG_VID, info.vendor
        )));
    }
    if !ODIN_PIDS.contains(&info.product) {
        return Err(Error::DeviceGone(format!(
            "device {} has wrong PID: got 0x{:04x}",
            info.sysname, info.product
        )));
    }
    Ok(info)
}

fn enumerate_targets(
    enumerator: &dyn DeviceEnumerator,
    opt: &Options,
) -> Result<Vec<UsbDeviceInfo>> {
    match &opt.target {
        Some(sysname) => Ok(vec![select_target(enumerator, sysname)?]),
        None => enumerator.enumerate(),
    }
}

/// Shared tail of both transports: checksum, expand, plan, flash.
fn flash_inputs(
    targets: &mut [Target],
    opt: &Options,
    cfg: &FlashConfig,
    ui: &UiHooks,
    mut pit_to_upload: Option<Arc<Vec<u8>>>,
) -> Result<i32> {
    let jobs = md5_check::md5_jobs(&opt.inputs)?;
    md5_check::md5_verify(&jobs, ui)?;

    let specs = planner::expand_inputs(&opt.inputs)?;
    let dl_mode = specs.iter().any(|s| s.download_list_mode);

    // A .pit member of the package doubles as the PIT to upload unless
    // one was given explicitly (download-list packages never do this).
    if pit_to_upload.is_none() && !dl_mode {
        if let Some(bytes) = planner::pit_from_specs(&specs) {
            pit_to_upload = Some(Arc::new(bytes));
        }
    }

    let srcs: Vec<ImageSpec> = specs
        .into_iter()
        .filter(|s| !planner::is_pit_name(&s.basename))
        .collect();
    if srcs.is_empty() {
        error!("no valid flashable files");
        return Ok(EXIT_NO_FLASH_FILES);
    }

    flasher::flash(targets, &srcs, pit_to_upload, cfg, ui)?;
    Ok(0)
}

fn run_wireless(opt: &Options) -> Result<i32> {
    if opt.print_pit {
        if let Some(f) = &opt.print_pit_file {
            print_pit_table(&pit::parse(&read_file(f)?)?);
            return Ok(0);
        }
    }

    let _lock = SingleInstanceLock::try_acquire(LOCK_NAME)?;

    let ui = progress::build_hooks();
    ui.stage("Waiting for wireless device");

    let listener = WirelessListener::bind()?;
    let conn = listener.accept_one()?;
    let dev_id = format!("wifi:{}", conn.peer_label());

    let _shield = SignalShield::enable(progress::signal_notice)?;

    ui.devices(1, &[dev_id.clone()]);

    let cfg = flash_config(opt);
    let sm = final_shutdown_mode(opt);
    let mut target = Target::new(dev_id, Box::new(conn));

    if opt.print_pit {
        let bytes = with_odin(target.link.as_mut(), &cfg, |odin| {
            download_pit_bytes(odin, cfg.preflash_retries)
        })?;
        print_pit_table(&pit::parse(&bytes)?);
        let _ = OdinLink::new(target.link.as_mut()).shutdown(sm, cfg.preflash_retries);
        return Ok(0);
    }

    if let Some(out) = &opt.get_pit {
        let bytes = with_odin(target.link.as_mut(), &cfg, |odin| {
            download_pit_bytes(odin, cfg.preflash_retries)
        })?;
        std::fs::write(out, &bytes)?;
        info!("Saved PIT to {}", out.display());
        let _ = OdinLink::new(target.link.as_mut()).shutdown(sm, cfg.preflash_retries);
        return Ok(0);
    }

    let mut targets = [target];

    if opt.reboot_only {
        flasher::flash(&mut targets, &[], None, &cfg, &ui)?;
        return Ok(0);
    }

    let pit_to_upload = match &opt.set_pit {
        Some(p) => Some(Arc::new(read_file(p)?)),
        None => None,
    };

    if opt.inputs.is_empty() {
        // Validation guarantees a PIT upload remains.
        flasher::flash(&mut targets, &[], pit_to_upload, &cfg, &ui)?;
        return Ok(0);
    }

    flash_inputs(&mut targets, opt, &cfg, &ui, pit_to_upload)
}

fn run_usb(opt: &Options) -> Result<i32> {
    let enumerator = NusbEnumerator;

    if opt.print_connected {
        for d in enumerator.enumerate()? {
            info!("Found device: {}", d.describe());
        }
        return Ok(0);
    }

    if opt.print_pit {
        if let Some(f) = &opt.print_pit_file {
            print_pit_table(&pit::parse(&read_file(f)?)?);
            return Ok(0);
        }
    }

    let _lock = SingleInstanceLock::try_acquire(LOCK_NAME)?;

    let devices = enumerate_targets(&enumerator, opt)?;
    if devices.is_empty() {
        error!("no supported devices found");
        return Ok(EXIT_NO_DEVICES);
    }

    let cfg = flash_config(opt);
    let sm = final_shutdown_mode(opt);

    if opt.print_pit || opt.get_pit.is_some() {
        if devices.len() != 1 {
            return Err(Error::Usage(
                "PIT download requires exactly one device (use --target)".into(),
            ));
        }

        let mut link = enumerator.open(&devices[0].sysname)?;
        let bytes = with_odin(link.as_mut(), &cfg, |odin| {
            download_pit_bytes(odin, cfg.preflash_retries)
        })?;

        if let Some(out) = &opt.get_pit {
            std::fs::write(out, &bytes)?;
            info!("Saved PIT to {}", out.display());
        } else {
            print_pit_table(&pit::parse(&bytes)?);
        }
        let _ = OdinLink::new(link.as_mut()).shutdown(sm, cfg.preflash_retries);
        return Ok(0);
    }

    let mut targets = Vec::with_capacity(devices.len());
    for d in &devices {
        targets.push(Target::new(d.sysname.clone(), enumerator.open(&d.sysname)?));
    }

    let ui = progress::build_hooks();
    let _shield = SignalShield::enable(progress::signal_notice)?;

    let ids: Vec<String> = devices.iter().map(|d| d.describe()).collect();
    ui.devices(ids.len(), &ids);

    if opt.reboot_only {
        flasher::flash(&mut targets, &[], None, &cfg, &ui)?;
        return Ok(0);
    }

    let pit_to_upload = match &opt.set_pit {
        Some(p) => Some(Arc::new(read_file(p)?)),
        None => None,
    };

    if opt.inputs.is_empty() {
        let Some(pit_bytes) = pit_to_upload else {
            // Nothing to do; validation normally rejects this earlier.
            return Err(Error::Usage("nothing to do (no inputs)".into()));
        };
        if pit_bytes.is_empty() {
            return Err(Error::PitParse("PIT upload requested but file is empty".into()));
        }
        flasher::flash(&mut targets, &[], Some(pit_bytes), &cfg, &ui)?;
        return Ok(0);
    }

    flash_inputs(&mut targets, opt, &cfg, &ui, pit_to_upload)
}

//! Terminal progress rendering
//!
//! Builds the [`UiHooks`] the coordinator reports through: a byte
//! progress bar plus status lines. Honors `NO_COLOR` via `colored`.

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info};

use crate::application::flasher::{PlanItem, PlanKind, UiHooks};

fn human_bytes(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut v = n as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit < UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n} B")
    } else {
        format!("{v:.1} {}", UNITS[unit])
    }
}

/// Wire a progress bar and status lines into coordinator hooks.
pub fn build_hooks() -> UiHooks {
    let bar = ProgressBar::hidden();
    bar.set_style(
        ProgressStyle::with_template(
            "{msg:24} [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec})",
        )
        .unwrap()
        .progress_chars("=> "),
    );

    let mut hooks = UiHooks::default();

    hooks.on_devices = Some(Box::new(|n, ids| {
        info!("Detected {n} device(s)");
        for id in ids {
            info!("  {id}");
        }
    }));

    hooks.on_model = Some(Box::new(|m| {
        info!("Bootloader family: {m}");
    }));

    {
        let bar = bar.clone();
        hooks.on_stage = Some(Box::new(move |s| {
            info!("{s}");
            bar.set_message(s.to_string());
        }));
    }

    {
        let bar = bar.clone();
        hooks.on_plan = Some(Box::new(move |plan: &[PlanItem], total| {
            info!("Transfer plan ({} total):", human_bytes(total));
            for (i, item) in plan.iter().enumerate() {
                match item.kind {
                    PlanKind::Pit => info!("  [{i}] {}", item.part_name),
                    PlanKind::Part => info!(
                        "  [{i}] {} <- {} ({})",
                        item.part_name,
                        item.source_base,
                        human_bytes(item.size)
                    ),
                }
            }
            bar.set_length(total);
            bar.set_position(0);
            bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        }));
    }

    {
        let bar = bar.clone();
        hooks.on_progress = Some(Box::new(move |overall_done, _, _, _| {
            bar.set_position(overall_done);
        }));
    }

    {
        let bar = bar.clone();
        hooks.on_error = Some(Box::new(move |msg| {
            bar.suspend(|| error!("{}", msg.red()));
        }));
    }

    hooks.on_done = Some(Box::new(move || {
        bar.finish_and_clear();
        eprintln!("{}", "DONE".green().bold());
    }));

    hooks
}

/// Notice printer for the signal shield.
pub fn signal_notice(desc: &str, count: u32) {
    let note = format!("{desc} ignored ({count} times) - do not disconnect");
    eprintln!("{}", note.as_str().yellow());
}

//! CLI argument definitions using clap
//!
//! This module defines the command-line argument structure and the
//! combination rules the engine relies on.

use clap::Parser;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// sindri - flash Samsung devices in Odin download mode
///
/// Flash inputs may be raw images, tar packages, or .tar.md5 packages
/// (the MD5 trailer is verified before any device is touched).
#[derive(Parser, Debug)]
#[command(name = "sindri")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// AP (application processor) image or package
    #[arg(short = 'a', value_name = "FILE")]
    pub ap: Option<PathBuf>,

    /// BL (bootloader) image or package
    #[arg(short = 'b', value_name = "FILE")]
    pub bl: Option<PathBuf>,

    /// CP (modem) image or package
    #[arg(short = 'c', value_name = "FILE")]
    pub cp: Option<PathBuf>,

    /// CSC image or package
    #[arg(short = 's', value_name = "FILE")]
    pub csc: Option<PathBuf>,

    /// USERDATA image or package
    #[arg(short = 'u', value_name = "FILE")]
    pub userdata: Option<PathBuf>,

    /// Accept one TCP connection on 0.0.0.0:13579 instead of USB
    #[arg(short = 'w', long)]
    pub wireless: bool,

    /// Flash a specific device (e.g. 3-2, see --print-connected)
    #[arg(long, value_name = "SYSNAME")]
    pub target: Option<String>,

    /// Download the PIT and save it to a file (single device only)
    #[arg(long = "get-pit", visible_alias = "get", value_name = "OUT")]
    pub get_pit: Option<PathBuf>,

    /// PIT to use for mapping (when flashing) or to upload alone
    #[arg(long = "set-pit", visible_alias = "set", value_name = "IN")]
    pub set_pit: Option<PathBuf>,

    /// Print a PIT; downloads from the device when no file is given
    #[arg(long = "print-pit", value_name = "IN", num_args = 0..=1)]
    pub print_pit: Option<Option<PathBuf>>,

    /// List connected download-mode devices
    #[arg(long = "print-connected")]
    pub print_connected: bool,

    /// Reboot the selected devices without flashing
    #[arg(long)]
    pub reboot: bool,

    /// Reboot back into download mode after the operation
    #[arg(long)]
    pub redownload: bool,

    /// Do not reboot after flashing
    #[arg(long = "no-reboot")]
    pub no_reboot: bool,
}

/// Validated options the run flows consume.
#[derive(Debug, Clone)]
pub struct Options {
    /// Flash inputs in transfer order (BL, AP, CP, CSC, USERDATA).
    pub inputs: Vec<PathBuf>,
    pub wireless: bool,
    pub target: Option<String>,
    pub get_pit: Option<PathBuf>,
    pub set_pit: Option<PathBuf>,
    pub print_pit: bool,
    pub print_pit_file: Option<PathBuf>,
    pub print_connected: bool,
    pub reboot_only: bool,
    pub redownload: bool,
    pub reboot_after_flash: bool,
}

fn usage(msg: &str) -> Error {
    Error::Usage(msg.into())
}

/// Apply the combination rules. Mirrors the behavior users rely on,
/// including one quirk: `--reboot` combined with flash inputs or PIT
/// operations is silently dropped rather than rejected.
pub fn validate(args: Args) -> Result<Options> {
    let mut inputs = Vec::with_capacity(5);
    for f in [&args.bl, &args.ap, &args.cp, &args.csc, &args.userdata]
        .into_iter()
        .flatten()
    {
        inputs.push(f.clone());
    }
    let any_flash_file = !inputs.is_empty();

    let (print_pit, print_pit_file) = match &args.print_pit {
        None => (false, None),
        Some(f) => (true, f.clone()),
    };

    let mut o = Options {
        inputs,
        wireless: args.wireless,
        target: args.target,
        get_pit: args.get_pit,
        set_pit: args.set_pit,
        print_pit,
        print_pit_file,
        print_connected: args.print_connected,
        reboot_only: args.reboot,
        redownload: args.redownload,
        reboot_after_flash: !args.no_reboot,
    };

    if o.wireless {
        if o.target.is_some() {
            return Err(usage("--wireless cannot be used with --target"));
        }
        if o.print_connected {
            return Err(usage("--wireless cannot be used with --print-connected"));
        }
        let has_op =
            o.reboot_only || o.get_pit.is_some() || o.set_pit.is_some() || any_flash_file;
        if !has_op {
            return Err(usage(
                "--wireless requires --reboot, --get-pit, --set-pit, or flash inputs",
            ));
        }
    }

    if o.print_pit {
        let has_other =
            o.get_pit.is_some() || o.set_pit.is_some() || any_flash_file || o.reboot_only;
        if has_other {
            return Err(usage(
                "--print-pit must be used alone (not with flashing, --get/--set, or --reboot)",
            ));
        }
    }

    if o.get_pit.is_some() && o.set_pit.is_some() {
        return Err(usage("cannot use --get-pit and --set-pit together"));
    }
    if o.get_pit.is_some() && any_flash_file {
        return Err(usage("--get-pit does not accept flash inputs"));
    }

    if o.reboot_only && !o.reboot_after_flash {
        return Err(usage("--reboot cannot be used with --no-reboot"));
    }

    let has_other_ops = o.get_pit.is_some() || o.set_pit.is_some() || any_flash_file;
    if o.reboot_only && has_other_ops {
        o.reboot_only = false;
    }

    if o.redownload {
        if !o.reboot_after_flash {
            return Err(usage("--redownload cannot be used with --no-reboot"));
        }
        if o.reboot_only {
            return Err(usage("--redownload cannot be used with --reboot"));
        }
        let allowed = has_other_ops || o.print_pit;
        if !allowed {
            return Err(usage("--redownload cannot be used alone"));
        }
    }

    Ok(o)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Result<Options> {
        let mut full = vec!["sindri"];
        full.extend_from_slice(argv);
        validate(Args::try_parse_from(full).unwrap())
    }

    #[test]
    fn flash_input_ordering_is_bl_first() {
        let o = parse(&["-a", "ap.tar", "-b", "bl.tar", "-u", "user.img"]).unwrap();
        let names: Vec<_> = o.inputs.iter().map(|p| p.to_str().unwrap()).collect();
        assert_eq!(names, ["bl.tar", "ap.tar", "user.img"]);
    }

    #[test]
    fn reboot_is_cleared_by_flash_files() {
        let o = parse(&["--reboot", "-a", "ap.tar"]).unwrap();
        assert!(!o.reboot_only);

        let o = parse(&["--reboot"]).unwrap();
        assert!(o.reboot_only);
    }

    #[test]
    fn conflicting_combinations_rejected() {
        assert!(parse(&["--reboot", "--no-reboot"]).is_err());
        assert!(parse(&["--redownload", "--no-reboot", "-a", "x"]).is_err());
        assert!(parse(&["--redownload"]).is_err());
        assert!(parse(&["--redownload", "--reboot"]).is_err());
        assert!(parse(&["--get-pit", "o.pit", "--set-pit", "i.pit"]).is_err());
        assert!(parse(&["--get-pit", "o.pit", "-a", "ap.tar"]).is_err());
        assert!(parse(&["--print-pit", "--reboot"]).is_err());
        assert!(parse(&["-w"]).is_err());
        assert!(parse(&["-w", "--target", "1-1", "-a", "x"]).is_err());
    }

    #[test]
    fn print_pit_with_and_without_file() {
        let o = parse(&["--print-pit", "saved.pit"]).unwrap();
        assert!(o.print_pit);
        assert_eq!(o.print_pit_file.as_deref().unwrap().to_str(), Some("saved.pit"));

        let o = parse(&["--print-pit"]).unwrap();
        assert!(o.print_pit);
        assert!(o.print_pit_file.is_none());
    }

    #[test]
    fn redownload_allowed_with_context() {
        assert!(parse(&["--redownload", "-a", "ap.tar"]).is_ok());
        assert!(parse(&["--redownload", "--set-pit", "i.pit"]).is_ok());
    }
}

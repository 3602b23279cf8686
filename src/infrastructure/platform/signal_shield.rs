//! Signal shield
//!
//! While a flash is in progress, termination signals must not kill the
//! process: a half-written bootloader partition bricks the device. The
//! shield absorbs SIGINT/SIGTERM/SIGHUP/SIGQUIT/SIGTSTP on a dedicated
//! thread and reports each delivery through a notice callback; it never
//! terminates the process itself.

use std::thread::JoinHandle;

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGPIPE, SIGQUIT, SIGTERM, SIGTSTP};
use signal_hook::iterator::Signals;

use crate::error::Result;

const SHIELDED: [i32; 5] = [SIGINT, SIGTERM, SIGHUP, SIGQUIT, SIGTSTP];

fn sig_desc(signo: i32) -> &'static str {
    match signo {
        SIGINT => "SIGINT",
        SIGTERM => "SIGTERM",
        SIGHUP => "SIGHUP",
        SIGQUIT => "SIGQUIT",
        SIGTSTP => "SIGTSTP",
        _ => "SIGNAL",
    }
}

pub struct SignalShield {
    handle: signal_hook::iterator::Handle,
    watcher: Option<JoinHandle<()>>,
}

impl SignalShield {
    /// Install the shield. `notice(desc, count)` runs on the watcher
    /// thread for every absorbed signal.
    pub fn enable(notice: impl Fn(&str, u32) + Send + 'static) -> Result<SignalShield> {
        // A dying peer must surface as an I/O error, not SIGPIPE.
        unsafe {
            let _ = signal_hook::low_level::register(SIGPIPE, || {});
        }

        let mut signals = Signals::new(SHIELDED)?;
        let handle = signals.handle();

        let watcher = std::thread::spawn(move || {
            let mut count = 0u32;
            for signo in signals.forever() {
                count += 1;
                notice(sig_desc(signo), count);
            }
        });

        Ok(SignalShield {
            handle,
            watcher: Some(watcher),
        })
    }
}

impl Drop for SignalShield {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(w) = self.watcher.take() {
            let _ = w.join();
        }
    }
}

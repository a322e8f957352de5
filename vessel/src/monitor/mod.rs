//! Container monitoring.
//!
//! After the container spawns, MASTER sits in a signal-driven loop until the
//! container exits. A side thread raises SIGURG once a second as a safety
//! net: under some kernel/scheduler conditions a SIGCHLD can be coalesced
//! away while we are between waits, and the tick guarantees the loop re-runs
//! its reap pass regardless.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{Signal, kill, raise};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use signal_hook::consts::signal as sig;
use signal_hook::iterator::Signals;
use tracing::{debug, warn};

use vessel_shared::constants::timeouts;
use vessel_shared::errors::{VesselError, VesselResult};

use crate::drivers::ImageDriver;
use crate::util::wait_status_to_exit_code;

pub struct Monitor<'a> {
    container_pid: Pid,
    driver: &'a mut dyn ImageDriver,
    signal_propagation: bool,
}

impl<'a> Monitor<'a> {
    pub fn new(
        container_pid: Pid,
        driver: &'a mut dyn ImageDriver,
        signal_propagation: bool,
    ) -> Self {
        Self {
            container_pid,
            driver,
            signal_propagation,
        }
    }

    /// Blocks until the container exits, reaping every child on the way and
    /// notifying the image driver. Returns the container's exit code, or the
    /// driver's error when a helper died while the container was running.
    pub fn run(&mut self) -> VesselResult<i32> {
        let mut signals = Signals::new([
            sig::SIGCHLD,
            sig::SIGURG,
            sig::SIGTSTP,
            sig::SIGINT,
            sig::SIGTERM,
            sig::SIGHUP,
            sig::SIGUSR1,
            sig::SIGUSR2,
        ])
        .map_err(|e| VesselError::Setup(format!("signal setup: {e}")))?;

        let ticker = Ticker::start();

        // A child may have exited before the handler was installed.
        if let Some(result) = self.reap_pass()? {
            return Ok(result);
        }

        for signal in signals.forever() {
            match signal {
                sig::SIGCHLD => {
                    if let Some(result) = self.reap_pass()? {
                        return Ok(result);
                    }
                }
                // The tick only exists to wake the loop; the reap pass runs
                // on the next iteration either way.
                sig::SIGURG => {
                    if let Some(result) = self.reap_pass()? {
                        return Ok(result);
                    }
                }
                sig::SIGTSTP => {
                    // Propagate the stop to our own process group parent.
                    debug!("SIGTSTP, stopping self");
                    let _ = raise(Signal::SIGSTOP);
                }
                other => {
                    if self.signal_propagation
                        && let Ok(signal) = Signal::try_from(other)
                    {
                        debug!(signal = ?signal, pid = ?self.container_pid, "forwarding signal");
                        let _ = kill(self.container_pid, signal);
                    }
                }
            }
        }

        drop(ticker);
        Err(VesselError::Setup("signal stream ended unexpectedly".into()))
    }

    /// One WNOHANG sweep. `Ok(Some(code))` when the container itself was
    /// reaped.
    pub fn reap_pass(&mut self) -> VesselResult<Option<i32>> {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => return Ok(None),
                Ok(status) => {
                    let Some(pid) = status.pid() else {
                        return Ok(None);
                    };
                    let code = wait_status_to_exit_code(status).unwrap_or(1);

                    if pid == self.container_pid {
                        debug!(code, "container exited");
                        return Ok(Some(code));
                    }

                    // Not the container: tell the driver. An error means a
                    // helper died underneath a live container, which is
                    // fatal and surfaces as the primary status.
                    self.driver.stopped(pid, code)?;
                }
                Err(nix::errno::Errno::ECHILD) => return Ok(None),
                Err(e) => {
                    warn!("waitpid: {e}");
                    return Ok(None);
                }
            }
        }
    }
}

/// Raises SIGURG against our own process once a second until dropped.
struct Ticker {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Ticker {
    fn start() -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("vessel-monitor-tick".into())
            .spawn(move || {
                while !stop_clone.load(Ordering::Relaxed) {
                    std::thread::sleep(timeouts::MONITOR_TICK);
                    if stop_clone.load(Ordering::Relaxed) {
                        break;
                    }
                    let _ = raise(Signal::SIGURG);
                }
            })
            .expect("failed to spawn ticker");

        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The reap pass calls waitpid(-1), which would steal children belonging
    // to other unit tests in this process; its tests live in
    // tests/monitor_reap.rs where they own the process.

    #[test]
    fn test_ticker_stops_on_drop() {
        let ticker = Ticker::start();
        drop(ticker); // must join promptly rather than hang
    }
}

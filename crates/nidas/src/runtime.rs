// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide runtime: signal handling and ordered teardown.
//!
//! One [`Runtime`] is created at the top of `main`. It installs the signal
//! handlers (SIGINT/SIGTERM request shutdown, SIGHUP a reconfigure-restart,
//! SIGUSR1 shutdown without restart; SIGPIPE is ignored process-wide),
//! touches the global sample pool so it exists before any acquisition
//! thread, and on drop waits for outstanding sample references to drain.
//!
//! Handlers only store to atomics; threads poll the flags at the top of
//! their loops and exit cleanly, flushing outputs and closing channels.

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::sample::SamplePool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Clean exit.
pub const EXIT_OK: i32 = 0;
/// Configuration or I/O failure during startup.
pub const EXIT_CONFIG: i32 = 1;
/// Unexpected runtime failure.
pub const EXIT_RUNTIME: i32 = 2;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static RESTART: AtomicBool = AtomicBool::new(false);
static NO_RESTART: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(sig: libc::c_int) {
    // async-signal-safe: atomic stores only
    match sig {
        libc::SIGINT | libc::SIGTERM => SHUTDOWN.store(true, Ordering::Release),
        libc::SIGHUP => RESTART.store(true, Ordering::Release),
        libc::SIGUSR1 => {
            NO_RESTART.store(true, Ordering::Release);
            SHUTDOWN.store(true, Ordering::Release);
        }
        _ => {}
    }
}

fn install(sig: libc::c_int, handler: libc::sighandler_t) -> Result<()> {
    // SAFETY: sigaction with a zeroed mask and a handler that is either
    // SIG_IGN or the async-signal-safe on_signal above.
    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = handler;
        libc::sigemptyset(&mut act.sa_mask);
        // no SA_RESTART: blocking reads should see EINTR and re-check flags
        act.sa_flags = 0;
        if libc::sigaction(sig, &act, std::ptr::null_mut()) != 0 {
            return Err(Error::io("sigaction", std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// How long `Drop` waits for the sample pool to drain.
const DRAIN_WAIT: Duration = Duration::from_secs(5);

pub struct Runtime {
    config: RuntimeConfig,
}

impl Runtime {
    /// Install signal handlers and initialize process-wide state.
    pub fn new() -> Result<Runtime> {
        install(libc::SIGPIPE, libc::SIG_IGN)?;
        install(libc::SIGINT, on_signal as libc::sighandler_t)?;
        install(libc::SIGTERM, on_signal as libc::sighandler_t)?;
        install(libc::SIGHUP, on_signal as libc::sighandler_t)?;
        install(libc::SIGUSR1, on_signal as libc::sighandler_t)?;

        // the pool must exist before the first sample allocation
        let _ = SamplePool::global();

        Ok(Runtime {
            config: RuntimeConfig::new(),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn pool(&self) -> &'static SamplePool {
        SamplePool::global()
    }

    /// Shutdown requested (SIGINT, SIGTERM or SIGUSR1).
    pub fn interrupted(&self) -> bool {
        SHUTDOWN.load(Ordering::Acquire)
    }

    /// Consume a pending SIGHUP restart request.
    pub fn take_restart_request(&self) -> bool {
        RESTART.swap(false, Ordering::AcqRel)
    }

    /// SIGUSR1 asked for shutdown without restart.
    pub fn restart_inhibited(&self) -> bool {
        NO_RESTART.load(Ordering::Acquire)
    }

    /// Manual trigger, for tests and internal shutdown paths.
    pub fn request_shutdown() {
        SHUTDOWN.store(true, Ordering::Release);
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        // pipelines are expected to be joined by now; give straggling
        // sample references a bounded chance to drain
        let pool = SamplePool::global();
        let deadline = Instant::now() + DRAIN_WAIT;
        loop {
            let outstanding = pool.stats().outstanding;
            if outstanding == 0 {
                break;
            }
            if Instant::now() >= deadline {
                log::error!("[Runtime] shutdown with {outstanding} samples outstanding");
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

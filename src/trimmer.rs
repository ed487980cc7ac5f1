//! Background trimmer (§4.9): clears `HOT` on a pass, sleeps a cadence
//! scaled to memory pressure, then unloads whatever now passes the unload
//! predicate. Runs as the engine's one dedicated background thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, trace};

use crate::types::{TRIM_INTERVAL_BUSY, TRIM_INTERVAL_IDLE, TRIM_INTERVAL_MODERATE};

/// Anything the trimmer needs to do to the engine each pass, kept behind a
/// trait so the trimmer thread itself has no dependency on `Bbp`'s fields.
pub trait Trimmable: Send + Sync {
    fn clear_hot(&self);
    fn trim(&self, aggressive: bool) -> usize;
    /// Fraction of the VM-pressure budget currently in use, in `[0, 1]`;
    /// governs how long the trimmer sleeps between passes (§4.9).
    fn memory_pressure(&self) -> f64;
}

fn cadence_for(pressure: f64) -> Duration {
    if pressure > 0.5 {
        TRIM_INTERVAL_BUSY
    } else if pressure > 0.25 {
        TRIM_INTERVAL_MODERATE
    } else {
        TRIM_INTERVAL_IDLE
    }
}

/// Handle to the running trimmer thread; dropping it does not stop the
/// thread, call `stop` and `join` explicitly (mirrors the engine's own
/// explicit `exit()` lifecycle, §1).
pub struct Trimmer {
    exit_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Trimmer {
    pub fn spawn(target: Arc<dyn Trimmable>) -> Self {
        let exit_flag = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&exit_flag);
        let handle = thread::Builder::new()
            .name("bbp-trimmer".into())
            .spawn(move || run(target, flag))
            .expect("failed to spawn trimmer thread");
        Self {
            exit_flag,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.exit_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Trimmer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(target: Arc<dyn Trimmable>, exit_flag: Arc<AtomicBool>) {
    while !exit_flag.load(Ordering::Relaxed) {
        target.clear_hot();
        let cadence = cadence_for(target.memory_pressure());
        trace!("trimmer sleeping {cadence:?}");
        sleep_in_slices(cadence, &exit_flag);
        if exit_flag.load(Ordering::Relaxed) {
            break;
        }
        let unloaded = target.trim(false);
        if unloaded > 0 {
            debug!("trimmer unloaded {unloaded} bats");
        }
    }
}

/// Sleeps `total`, but in short slices, so `stop()` is noticed promptly
/// instead of after a full 10s idle-cadence sleep.
fn sleep_in_slices(total: Duration, exit_flag: &AtomicBool) {
    const SLICE: Duration = Duration::from_millis(50);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if exit_flag.load(Ordering::Relaxed) {
            return;
        }
        let slice = remaining.min(SLICE);
        thread::sleep(slice);
        remaining -= slice;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingTarget {
        clears: AtomicUsize,
        trims: AtomicUsize,
    }

    impl Trimmable for CountingTarget {
        fn clear_hot(&self) {
            self.clears.fetch_add(1, Ordering::SeqCst);
        }
        fn trim(&self, _aggressive: bool) -> usize {
            self.trims.fetch_add(1, Ordering::SeqCst);
            0
        }
        fn memory_pressure(&self) -> f64 {
            0.9 // busy: shortest cadence, so the test doesn't stall
        }
    }

    #[test]
    fn cadence_picks_busy_bucket_under_pressure() {
        assert_eq!(cadence_for(0.9), TRIM_INTERVAL_BUSY);
        assert_eq!(cadence_for(0.3), TRIM_INTERVAL_MODERATE);
        assert_eq!(cadence_for(0.1), TRIM_INTERVAL_IDLE);
    }

    #[test]
    fn trimmer_runs_at_least_one_pass_before_stop() {
        let target = Arc::new(CountingTarget {
            clears: AtomicUsize::new(0),
            trims: AtomicUsize::new(0),
        });
        let mut trimmer = Trimmer::spawn(target.clone());
        thread::sleep(Duration::from_millis(200));
        trimmer.stop();
        assert!(target.clears.load(Ordering::SeqCst) >= 1);
    }
}

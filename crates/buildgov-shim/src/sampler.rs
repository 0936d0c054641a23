//! Child memory sampler.
//!
//! While the real tool runs, a background thread samples its working set
//! and committed bytes at ~10 Hz, keeping running maxima. A final sample is
//! taken when the stop flag flips, just before the shim reports release
//! figures. Sampling is read-only and touches no shared state beyond the
//! two peak counters.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use buildgov_core::memory::{MemoryProbe, SystemProbe};

/// Sampling cadence (~10 Hz).
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// Running peak memory for one child process.
#[derive(Debug, Default)]
pub struct PeakMemory {
    working_set: AtomicU64,
    commit: AtomicU64,
}

impl PeakMemory {
    /// Folds one sample into the peaks.
    pub fn observe(&self, working_set_bytes: u64, commit_bytes: u64) {
        self.working_set
            .fetch_max(working_set_bytes, Ordering::Relaxed);
        self.commit.fetch_max(commit_bytes, Ordering::Relaxed);
    }

    /// Peak working-set bytes seen so far.
    #[must_use]
    pub fn working_set_bytes(&self) -> u64 {
        self.working_set.load(Ordering::Relaxed)
    }

    /// Peak committed bytes seen so far.
    #[must_use]
    pub fn commit_bytes(&self) -> u64 {
        self.commit.load(Ordering::Relaxed)
    }
}

/// A running sampler for one child pid.
pub struct Sampler {
    peaks: Arc<PeakMemory>,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Sampler {
    /// Starts sampling `pid` on a dedicated thread.
    ///
    /// The thread exits on [`Sampler::finish`]; a child that disappears
    /// early just stops contributing samples.
    #[must_use]
    pub fn start(pid: u32) -> Self {
        let peaks = Arc::new(PeakMemory::default());
        let stop = Arc::new(AtomicBool::new(false));

        let thread_peaks = Arc::clone(&peaks);
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            let probe = SystemProbe::new();
            loop {
                if let Some(mem) = probe.sample_process(pid) {
                    thread_peaks.observe(mem.working_set_bytes, mem.commit_bytes);
                }
                if thread_stop.load(Ordering::Relaxed) {
                    // One last sample raced the stop flag above; done.
                    break;
                }
                std::thread::sleep(SAMPLE_INTERVAL);
            }
        });

        Self {
            peaks,
            stop,
            handle,
        }
    }

    /// Shared handle to the peaks, readable while sampling runs.
    #[must_use]
    pub fn peaks(&self) -> Arc<PeakMemory> {
        Arc::clone(&self.peaks)
    }

    /// Stops the sampler and returns the final peaks.
    #[must_use]
    pub fn finish(self) -> (u64, u64) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.handle.join();
        (self.peaks.working_set_bytes(), self.peaks.commit_bytes())
    }
}

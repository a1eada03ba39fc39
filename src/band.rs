//! Band-parallel execution pool.
//!
//! Both signal-processing stages split their work into horizontal bands and
//! dispatch one long-lived worker thread per band. Workers idle on a start
//! event, run their band, signal done, and wait again; a stop event makes the
//! teardown clean even if no start was ever issued. Threads are created once
//! at stage initialisation so no allocation or thread spawn sits on the
//! per-frame path.
//!
//! Per-band row ranges are recomputed every frame from the current image
//! height divided by the band count, with the remainder added to the last
//! band.

// The dispatched job borrows stage buffers for the duration of one `run`
// call; the pointer is type-erased to cross into the long-lived workers and
// `run` does not return until every band has signalled done.
#![allow(unsafe_code)]

use std::ops::Range;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::error::{StereoError, StereoResult};

/// Default number of bands.
pub const DEFAULT_BANDS: usize = 8;

/// Upper bound on the band count.
pub const MAX_BANDS: usize = 40;

/// A band job: `(band_index, row_range)`.
type BandFn<'a> = &'a (dyn Fn(usize, Range<usize>) + Sync);

/// Lifetime-erased job reference shipped to a worker.
///
/// Only valid between the start signal and the matching done signal; `run`
/// keeps the underlying closure alive for that whole window.
#[derive(Clone, Copy)]
struct JobPtr(&'static (dyn Fn(usize, Range<usize>) + Sync));

struct BandSlot {
    /// Pending job + row range; `None` means idle.
    job: Mutex<Option<(JobPtr, Range<usize>)>>,
    start: Condvar,
    stop: Mutex<bool>,
}

struct DoneLatch {
    remaining: Mutex<usize>,
    all_done: Condvar,
}

/// Fixed-size pool of band worker threads.
pub struct BandPool {
    slots: Vec<Arc<BandSlot>>,
    latch: Arc<DoneLatch>,
    handles: Vec<JoinHandle<()>>,
    bands: usize,
}

impl BandPool {
    /// Create `bands` workers (clamped to `1..=MAX_BANDS`). A single band
    /// runs inline on the caller thread and spawns nothing. Thread creation
    /// failure is a resource error, fatal at stage init.
    pub fn new(bands: usize) -> StereoResult<Self> {
        let bands = bands.clamp(1, MAX_BANDS);

        let latch = Arc::new(DoneLatch {
            remaining: Mutex::new(0),
            all_done: Condvar::new(),
        });

        let mut slots = Vec::new();
        let mut handles = Vec::new();

        if bands > 1 {
            for index in 0..bands {
                let slot = Arc::new(BandSlot {
                    job: Mutex::new(None),
                    start: Condvar::new(),
                    stop: Mutex::new(false),
                });

                let worker_slot = Arc::clone(&slot);
                let worker_latch = Arc::clone(&latch);
                let handle = std::thread::Builder::new()
                    .name(format!("band-{index}"))
                    .spawn(move || band_worker(index, &worker_slot, &worker_latch))
                    .map_err(|e| {
                        StereoError::Resource(format!("failed to spawn band worker {index}: {e}"))
                    })?;

                slots.push(slot);
                handles.push(handle);
            }
        }

        Ok(Self {
            slots,
            latch,
            handles,
            bands,
        })
    }

    /// Number of bands.
    pub fn bands(&self) -> usize {
        self.bands
    }

    /// Run `job` across `total_rows`, one band per worker, and wait for all
    /// bands to finish before returning.
    pub fn run(&self, total_rows: usize, job: BandFn<'_>) {
        if self.bands <= 1 || self.slots.is_empty() {
            job(0, 0..total_rows);
            return;
        }

        let ranges = band_ranges(total_rows, self.bands);

        {
            let mut remaining = self.latch.remaining.lock();
            *remaining = self.bands;
        }

        // SAFETY: erase the borrow lifetime; `run` blocks on the done latch
        // below, so the closure and everything it borrows outlive every
        // worker's use of this reference.
        let ptr = JobPtr(unsafe {
            std::mem::transmute::<BandFn<'_>, &'static (dyn Fn(usize, Range<usize>) + Sync)>(job)
        });

        for (slot, range) in self.slots.iter().zip(ranges) {
            let mut pending = slot.job.lock();
            *pending = Some((ptr, range));
            slot.start.notify_one();
        }

        let mut remaining = self.latch.remaining.lock();
        while *remaining > 0 {
            self.latch.all_done.wait(&mut remaining);
        }
    }
}

impl Drop for BandPool {
    fn drop(&mut self) {
        for slot in &self.slots {
            // Holding the job lock pins the worker either inside the wait or
            // before its next stop check, so the wakeup cannot be lost.
            let _pending = slot.job.lock();
            *slot.stop.lock() = true;
            slot.start.notify_one();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn band_worker(index: usize, slot: &BandSlot, latch: &DoneLatch) {
    loop {
        let work = {
            let mut pending = slot.job.lock();
            loop {
                if *slot.stop.lock() {
                    return;
                }
                if let Some(work) = pending.take() {
                    break work;
                }
                slot.start.wait(&mut pending);
            }
        };

        let (ptr, range) = work;
        // `run` holds the closure alive until the done latch opens.
        let job = ptr.0;
        job(index, range);

        let mut remaining = latch.remaining.lock();
        *remaining -= 1;
        if *remaining == 0 {
            latch.all_done.notify_all();
        }
    }
}

/// Split `total_rows` into `bands` contiguous ranges; the remainder rows are
/// added to the last band.
pub fn band_ranges(total_rows: usize, bands: usize) -> Vec<Range<usize>> {
    let bands = bands.max(1);
    let height = total_rows / bands;
    (0..bands)
        .map(|i| {
            let start = i * height;
            let end = if i + 1 == bands { total_rows } else { start + height };
            start..end
        })
        .collect()
}

use std::sync::atomic::Ordering;
use std::sync::{Arc, MutexGuard};
use std::thread;
use std::time::Duration;

use log::debug;

use crate::acq::filter::HeaderMap;
use crate::acq::Shared;
use crate::wfm::Waveform;
use crate::wire::WaveformHeader;
use crate::Error;

const SPIN_INTERVAL: Duration = Duration::from_micros(100);

/// Criterion deciding when an access scope may be entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcqWaitOn {
    /// Proceed at once if unseen data is already published, otherwise wait
    /// for the next acquisition.
    NewData,
    /// Wait for an acquisition published after this call.
    NextAcq,
    /// Proceed once any acquisition is present, seen before or not.
    AnyAcq,
    /// Wait until the published acquisition time reaches the `after`
    /// threshold, in seconds since session start.
    Time,
}

impl Shared {
    pub(crate) fn wait_for_data(
        &self,
        on: AcqWaitOn,
        after: f64,
    ) -> Result<MutexGuard<'_, ()>, Error> {
        match on {
            AcqWaitOn::NewData => {
                if self.snapshot_ready() && self.has_unseen() {
                    let guard = self.publish.lock().unwrap();
                    if self.pending_release.load(Ordering::Acquire) == 0 {
                        self.pending_release.store(1, Ordering::Release);
                    }
                    return Ok(guard);
                }
                self.claim(|shared| shared.snapshot_ready() && shared.has_unseen())
            }
            AcqWaitOn::NextAcq => {
                self.claim(|shared| shared.snapshot_ready() && shared.has_unseen())
            }
            AcqWaitOn::AnyAcq => self.claim(|shared| {
                shared.acqcount.load(Ordering::Acquire) > 0 && shared.snapshot_ready()
            }),
            AcqWaitOn::Time => {
                self.claim(move |shared| shared.snapshot_ready() && after <= shared.acqtime())
            }
        }
    }

    /*
    The acquisition loop holds the publish lock across its whole fetch, so a
    waiter cannot park on a condition variable tied to that lock. Instead the
    claim is acquire-check-release: take the lock, re-check the predicate
    under it, and on failure give the lock back and retry after a short
    sleep so the loop can make progress.
    */
    fn claim(&self, ready: impl Fn(&Shared) -> bool) -> Result<MutexGuard<'_, ()>, Error> {
        loop {
            if self.stop.load(Ordering::Acquire) {
                return Err(Error::SessionClosed);
            }

            let guard = self.publish.lock().unwrap();
            if ready(self) {
                self.pending_release.fetch_add(1, Ordering::AcqRel);
                return Ok(guard);
            }

            drop(guard);
            thread::sleep(SPIN_INTERVAL);
        }
    }

    /// Marks the claimed acquisition as seen. A release with no pending
    /// claim is a stale attempt; it is logged and otherwise ignored.
    pub(crate) fn release(&self) {
        if self.pending_release.load(Ordering::Acquire) == 0 {
            debug!("{}: release with no wait pending", self.clientname);
            return;
        }

        self.pending_release.fetch_sub(1, Ordering::AcqRel);
        self.lastacqseen
            .store(self.acqcount.load(Ordering::Acquire), Ordering::Release);
    }
}

/// Claimed access to one published acquisition. While the scope lives, the
/// acquisition loop cannot replace the snapshot, so every lookup observes
/// the same acquisition. Dropping the scope releases the claim on every
/// exit path.
pub struct AccessScope<'a> {
    pub(crate) shared: &'a Shared,
    pub(crate) guard: Option<MutexGuard<'a, ()>>,
}

impl AccessScope<'_> {
    /// Waveform published for the named source, case-insensitive.
    pub fn get(&self, name: &str) -> Option<Arc<Waveform>> {
        self.shared.cache.lock().unwrap().get(name)
    }

    /// Header of the claimed acquisition for the named source.
    pub fn header(&self, name: &str) -> Option<WaveformHeader> {
        self.shared.cache.lock().unwrap().header(name)
    }

    /// The claimed acquisition's full header map.
    pub fn headers(&self) -> HeaderMap {
        self.shared.cache.lock().unwrap().headers().clone()
    }
}

impl Drop for AccessScope<'_> {
    fn drop(&mut self) {
        self.shared.release();
        self.guard.take();
    }
}

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, error, trace};

use crate::wfm::Waveform;
use crate::wire::{ScopeChannel, WaveformRequest};
use crate::Error;

pub(crate) mod cache;
pub(crate) mod decode;
pub mod filter;
pub mod wait;

use cache::Snapshot;
use decode::DecodeOutcome;
use filter::{AcqFilter, HeaderMap};

/// Invoked from the background worker once per accepted acquisition, after
/// the snapshot is published.
pub type AcqCallback = Box<dyn Fn(&[Arc<Waveform>]) + Send + Sync>;

/// Per-session state shared between the foreground API and the acquisition
/// worker. The publish mutex is held by the worker across one whole fetch
/// and claimed by waiters; the cache mutex guards only short map accesses.
pub(crate) struct Shared {
    pub(crate) channel: Arc<dyn ScopeChannel>,
    pub(crate) clientname: String,
    pub(crate) symbols: Vec<String>,

    pub(crate) cache: Mutex<Snapshot>,
    pub(crate) publish: Mutex<()>,
    pub(crate) filter: Mutex<AcqFilter>,
    callback: Option<AcqCallback>,

    pub(crate) acqcount: AtomicU64,
    pub(crate) lastacqseen: AtomicU64,
    acqtime_bits: AtomicU64,
    pub(crate) pending_release: AtomicU64,

    pub(crate) stop: AtomicBool,
    pub(crate) connected: AtomicBool,
    holding_window: AtomicBool,

    started: Instant,
}

impl Shared {
    pub(crate) fn new(
        channel: Arc<dyn ScopeChannel>,
        clientname: String,
        symbols: Vec<String>,
        filter: AcqFilter,
        callback: Option<AcqCallback>,
    ) -> Self {
        Shared {
            channel,
            clientname,
            symbols,
            cache: Mutex::new(Snapshot::default()),
            publish: Mutex::new(()),
            filter: Mutex::new(filter),
            callback,
            acqcount: AtomicU64::new(0),
            lastacqseen: AtomicU64::new(0),
            acqtime_bits: AtomicU64::new((-1f64).to_bits()),
            pending_release: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            holding_window: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    pub(crate) fn snapshot_ready(&self) -> bool {
        !self.cache.lock().unwrap().is_empty()
    }

    pub(crate) fn has_unseen(&self) -> bool {
        self.lastacqseen.load(Ordering::Acquire) < self.acqcount.load(Ordering::Acquire)
    }

    /// Wall-clock stamp of the last published acquisition, in seconds since
    /// session start. -1 until the first publish.
    pub(crate) fn acqtime(&self) -> f64 {
        f64::from_bits(self.acqtime_bits.load(Ordering::Acquire))
    }

    fn stamp_acqtime(&self) {
        self.acqtime_bits
            .store(self.current_time().to_bits(), Ordering::Release);
    }

    pub(crate) fn current_time(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub(crate) fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            if let Err(err) = self.channel.disconnect(&self.clientname) {
                debug!("{}: disconnect failed: {err}", self.clientname);
            }
        }
    }

    /// Returns the datastore to the server if this session still holds a
    /// window. Safe to call from any thread; the at-exit path uses it.
    pub(crate) fn release_window_if_held(&self) {
        if self.holding_window.swap(false, Ordering::AcqRel) {
            if let Err(err) = self.channel.finished_with_data_access(&self.clientname) {
                debug!(
                    "{}: finished with data access failed: {err}",
                    self.clientname
                );
            }
        }
    }

    fn run_filter(&self, current: &HeaderMap) -> bool {
        let cache = self.cache.lock().unwrap();
        let filter = self.filter.lock().unwrap();

        match panic::catch_unwind(AssertUnwindSafe(|| (*filter)(cache.headers(), current))) {
            Ok(accept) => accept,
            Err(_) => {
                error!(
                    "{}: acquisition filter panicked, acquisition rejected",
                    self.clientname
                );
                false
            }
        }
    }
}

/// Returns the access window on every exit path of a fetch iteration; the
/// server resumes acquiring only after this fires.
struct WindowGuard<'a> {
    shared: &'a Shared,
}

impl Drop for WindowGuard<'_> {
    fn drop(&mut self) {
        self.shared.release_window_if_held();
    }
}

/// Background worker: negotiate an access window, fetch and publish one
/// acquisition, release the window, repeat until stopped.
pub(crate) fn acq_loop(shared: Arc<Shared>) {
    let mut prev_data_id: Option<u64> = None;

    while !shared.stop.load(Ordering::Acquire) {
        if let Err(err) = shared.channel.wait_for_data_access(&shared.clientname) {
            if !shared.stop.load(Ordering::Acquire) {
                error!("{}: wait for data access failed: {err}", shared.clientname);
            }
            break;
        }

        shared.holding_window.store(true, Ordering::Release);
        let window = WindowGuard { shared: &shared };

        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        match fetch_acquisition(&shared, &mut prev_data_id, window) {
            Ok(Some(accepted)) => {
                shared.acqcount.fetch_add(1, Ordering::AcqRel);
                shared.stamp_acqtime();
                notify(&shared, &accepted);
            }
            Ok(None) => {}
            Err(err) => {
                if !shared.stop.load(Ordering::Acquire) {
                    error!("{}: acquisition aborted: {err}", shared.clientname);
                }
                break;
            }
        }
    }

    debug!("{}: acquisition worker stopped", shared.clientname);
}

/// One fetch iteration under an open access window. Returns the accepted
/// waveforms, or None when the acquisition was a duplicate, rejected,
/// cancelled or headerless. Any error releases the window with no snapshot
/// mutation committed.
fn fetch_acquisition(
    shared: &Shared,
    prev_data_id: &mut Option<u64>,
    window: WindowGuard<'_>,
) -> Result<Option<Vec<Arc<Waveform>>>, Error> {
    let publish = shared.publish.lock().unwrap();

    let mut headers = Vec::with_capacity(shared.symbols.len());
    let mut header_map = HeaderMap::new();
    for symbol in &shared.symbols {
        let header = shared.channel.get_header(&WaveformRequest::new(symbol))?;
        if header.is_valid() {
            header_map.insert(header.sourcename.to_lowercase(), header.clone());
            headers.push(header);
        }
    }

    // The first header's data id identifies the whole acquisition.
    let data_id = match headers.first() {
        Some(header) => header.dataid,
        None => return Ok(None),
    };
    if *prev_data_id == Some(data_id) {
        trace!("{}: duplicate acquisition {data_id}", shared.clientname);
        return Ok(None);
    }
    *prev_data_id = Some(data_id);

    if !shared.run_filter(&header_map) {
        // Keep the rejected headers so the next filter run compares against
        // the latest settings seen.
        shared.cache.lock().unwrap().replace_headers(header_map);
        return Ok(None);
    }

    let mut decoded = Vec::with_capacity(headers.len());
    for header in &headers {
        let chunks = shared
            .channel
            .get_waveform(&WaveformRequest::new(&header.sourcename))?;

        match decode::decode_waveform(header, chunks, &shared.stop)? {
            DecodeOutcome::Complete(waveform) => {
                decoded.push((header.sourcename.to_lowercase(), Arc::new(waveform)));
            }
            DecodeOutcome::Mismatch { expected, received } => {
                error!(
                    "{}: payload was {received} bytes, header implies {expected}; source withheld",
                    header.sourcename
                );
            }
            DecodeOutcome::Cancelled => return Ok(None),
            DecodeOutcome::UnsupportedType(tag) => {
                error!(
                    "{}: unknown waveform type tag {tag}; source withheld",
                    header.sourcename
                );
            }
        }
    }

    let accepted: Vec<Arc<Waveform>> = decoded.iter().map(|(_, wfm)| Arc::clone(wfm)).collect();
    shared.cache.lock().unwrap().publish(decoded, header_map);

    // Publish lock first, then the window; the server needs the window back
    // only after the snapshot is consistent.
    drop(publish);
    drop(window);

    Ok(Some(accepted))
}

fn notify(shared: &Shared, accepted: &[Arc<Waveform>]) {
    if accepted.is_empty() {
        return;
    }

    if let Some(callback) = &shared.callback {
        if panic::catch_unwind(AssertUnwindSafe(|| callback(accepted))).is_err() {
            error!("{}: acquisition callback panicked", shared.clientname);
        }
    }
}

//! Client for the high-speed streaming data service of Tektronix
//! oscilloscopes. A background worker negotiates synchronized access
//! windows with the instrument and publishes per-acquisition waveform
//! snapshots; foreground callers claim a snapshot through an access scope
//! and read decoded waveforms by source name.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, Once, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error};
use once_cell::sync::Lazy;
use rand::Rng;

mod err;
pub use err::*;

pub mod wfm;
pub mod wire;

mod acq;
pub use acq::filter::{any_acq, any_horizontal_change, any_vertical_change, AcqFilter, HeaderMap};
pub use acq::wait::{AccessScope, AcqWaitOn};
pub use acq::AcqCallback;

use acq::Shared;
use wfm::Waveform;
use wire::ScopeChannel;

const CLOSE_JOIN_TIMEOUT: Duration = Duration::from_secs(20);

/// Live sessions by client name, drained by the termination hook when the
/// process is interrupted before sessions were closed in an orderly way.
static SESSIONS: Lazy<Mutex<HashMap<String, Weak<Shared>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static TERMINATE_HOOK: Once = Once::new();

/// Session construction parameters for [`Connection::open`].
#[derive(Default)]
pub struct ConnectOptions {
    /// Sources to read on every acquisition, case-insensitive. `None` or an
    /// empty list means every source the server reports.
    pub symbols: Option<Vec<String>>,
    /// Invoked from the background worker once per accepted acquisition,
    /// after the snapshot is published.
    pub on_acquisition: Option<AcqCallback>,
    /// Acceptance filter; accepts every acquisition when absent.
    pub filter: Option<AcqFilter>,
}

/// One client session on an instrument channel.
///
/// Opening a session registers a fresh random client name with the server
/// and starts the acquisition worker; dropping it (or calling
/// [`Connection::close`]) stops the worker and deregisters.
pub struct Connection {
    shared: Arc<Shared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Connection {
    /// Opens a session over an already-dialed channel.
    pub fn open(
        channel: Arc<dyn ScopeChannel>,
        options: ConnectOptions,
    ) -> Result<Connection, Error> {
        let clientname = random_client_name();

        channel.connect(&clientname)?;

        let symbols = match options.symbols.filter(|symbols| !symbols.is_empty()) {
            Some(symbols) => symbols.iter().map(|s| s.to_lowercase()).collect(),
            None => match channel.request_available_names(&clientname) {
                Ok(symbols) => symbols.iter().map(|s| s.to_lowercase()).collect(),
                Err(err) => {
                    let _ = channel.disconnect(&clientname);
                    return Err(err);
                }
            },
        };

        let filter = options.filter.unwrap_or_else(|| Box::new(any_acq));
        let shared = Arc::new(Shared::new(
            channel,
            clientname,
            symbols,
            filter,
            options.on_acquisition,
        ));

        SESSIONS
            .lock()
            .unwrap()
            .insert(shared.clientname.clone(), Arc::downgrade(&shared));
        install_terminate_hook();

        let worker = {
            let shared = shared.clone();
            thread::spawn(move || acq::acq_loop(shared))
        };

        Ok(Connection {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queries the server for its currently available source names.
    pub fn available_symbols(&self) -> Result<Vec<String>, Error> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(Error::SessionClosed);
        }
        self.shared
            .channel
            .request_available_names(&self.shared.clientname)
    }

    /// The active source set, normalized to lowercase.
    pub fn source_names(&self) -> &[String] {
        &self.shared.symbols
    }

    /// The random client name this session registered with the server.
    pub fn client_name(&self) -> &str {
        &self.shared.clientname
    }

    /// Waveform from the most recent published acquisition,
    /// case-insensitive. Call inside an access scope to pin a consistent
    /// acquisition across several lookups.
    pub fn get(&self, name: &str) -> Option<Arc<Waveform>> {
        self.shared.cache.lock().unwrap().get(name)
    }

    /// Waits per the given discipline and claims the published acquisition.
    /// `after` is only meaningful for [`AcqWaitOn::Time`]; pass -1.0
    /// otherwise.
    pub fn access(&self, on: AcqWaitOn, after: f64) -> Result<AccessScope<'_>, Error> {
        if on == AcqWaitOn::Time && !after.is_finite() {
            return Err(Error::InvalidArgument(
                "time wait threshold must be finite".to_string(),
            ));
        }

        let guard = self.shared.wait_for_data(on, after)?;
        Ok(AccessScope {
            shared: &self.shared,
            guard: Some(guard),
        })
    }

    /// Swaps the acceptance filter. Acquisitions seen so far stay seen.
    pub fn set_filter(&self, filter: AcqFilter) {
        let mut slot = self.shared.filter.lock().unwrap();
        *slot = filter;
        self.shared.lastacqseen.store(
            self.shared.acqcount.load(Ordering::Acquire),
            Ordering::Release,
        );
    }

    /// Asks the instrument for a fresh access window even if no new
    /// acquisition has completed, e.g. to read a stopped scope's current
    /// data. No-op once the session is closed.
    pub fn force_sequence(&self) -> Result<(), Error> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        self.shared
            .channel
            .request_new_sequence(&self.shared.clientname)
    }

    /// Number of accepted acquisitions published so far.
    pub fn acquisition_count(&self) -> u64 {
        self.shared.acqcount.load(Ordering::Acquire)
    }

    /// Seconds since this session started, the clock used for acquisition
    /// stamps and the [`AcqWaitOn::Time`] discipline.
    pub fn current_time(&self) -> f64 {
        self.shared.current_time()
    }

    /// Full shutdown: stops the worker, waits for it within a bound, then
    /// deregisters from the server. Idempotent; RPC errors on this path are
    /// logged, not returned.
    pub fn close(&self) {
        if !self.shared.connected.load(Ordering::Acquire) {
            return;
        }

        self.shared.stop.store(true, Ordering::Release);

        // The worker may be blocked waiting for a window; a forced sequence
        // gives it one in which to observe the stop flag.
        if let Err(err) = self
            .shared
            .channel
            .request_new_sequence(&self.shared.clientname)
        {
            debug!(
                "{}: force sequence during close failed: {err}",
                self.shared.clientname
            );
        }

        if let Some(worker) = self.worker.lock().unwrap().take() {
            join_with_timeout(worker, CLOSE_JOIN_TIMEOUT, &self.shared.clientname);
        }

        self.shared.disconnect();

        SESSIONS.lock().unwrap().remove(&self.shared.clientname);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn random_client_name() -> String {
    format!("{:032x}", rand::thread_rng().gen::<u128>())
}

fn join_with_timeout(worker: thread::JoinHandle<()>, timeout: Duration, clientname: &str) {
    let deadline = Instant::now() + timeout;

    while !worker.is_finished() {
        if Instant::now() >= deadline {
            debug!("{clientname}: worker did not stop within {timeout:?}, disconnecting anyway");
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }

    if worker.join().is_err() {
        error!("{clientname}: worker panicked");
    }
}

fn install_terminate_hook() {
    TERMINATE_HOOK.call_once(|| {
        let result = ctrlc::set_handler(|| {
            terminate_sessions();
            std::process::exit(130);
        });
        if let Err(err) = result {
            // The host application owns the signal; orderly drops still
            // clean up.
            debug!("termination hook not installed: {err}");
        }
    });
}

/// Best-effort teardown of every live session: return any held access
/// window so the instrument can resume acquiring, then deregister. Every
/// error on this path is suppressed.
fn terminate_sessions() {
    let sessions: Vec<Weak<Shared>> = match SESSIONS.lock() {
        Ok(map) => map.values().cloned().collect(),
        Err(_) => return,
    };

    for weak in sessions {
        if let Some(shared) = weak.upgrade() {
            shared.stop.store(true, Ordering::Release);
            shared.release_window_if_held();
            shared.disconnect();
        }
    }
}

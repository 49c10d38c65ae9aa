//! In-process fake instrument for driving the client end to end. It serves
//! queued acquisitions through the access-window protocol and counts the
//! payload RPCs it receives.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use scopestream::wire::{
    ChunkStream, ConnectService, NativeDataService, WaveformHeader, WaveformRequest,
};
use scopestream::Error;

/// One acquisition the fake will serve: headers plus per-source payload
/// bytes, keyed by lowercase source name.
#[derive(Default, Clone)]
pub struct Acquisition {
    headers: Vec<WaveformHeader>,
    payloads: HashMap<String, Vec<u8>>,
}

impl Acquisition {
    pub fn new() -> Self {
        Acquisition::default()
    }

    pub fn with_source(mut self, header: WaveformHeader, payload: Vec<u8>) -> Self {
        self.payloads
            .insert(header.sourcename.to_lowercase(), payload);
        self.headers.push(header);
        self
    }
}

#[derive(Default)]
struct State {
    queue: VecDeque<Acquisition>,
    current: Option<Acquisition>,
    force: bool,
    connected: HashSet<String>,
}

pub struct FakeScope {
    state: Mutex<State>,
    window: Condvar,
    symbols: Vec<String>,
    get_waveform_calls: AtomicUsize,
    windows_served: AtomicUsize,
}

impl FakeScope {
    pub fn new(symbols: &[&str]) -> Self {
        FakeScope {
            state: Mutex::new(State::default()),
            window: Condvar::new(),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            get_waveform_calls: AtomicUsize::new(0),
            windows_served: AtomicUsize::new(0),
        }
    }

    /// Queues an acquisition; the next access window serves it.
    pub fn publish(&self, acq: Acquisition) {
        let mut state = self.state.lock().unwrap();
        state.queue.push_back(acq);
        drop(state);
        self.window.notify_all();
    }

    /// Installs an acquisition as the stopped scope's current data. It is
    /// only served once a client forces a sequence.
    pub fn preload(&self, acq: Acquisition) {
        self.state.lock().unwrap().current = Some(acq);
    }

    pub fn get_waveform_calls(&self) -> usize {
        self.get_waveform_calls.load(Ordering::Acquire)
    }

    /// Number of access windows opened and closed so far.
    pub fn windows_served(&self) -> usize {
        self.windows_served.load(Ordering::Acquire)
    }
}

impl ConnectService for FakeScope {
    fn connect(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if !state.connected.insert(name.to_string()) {
            return Err(Error::AlreadyInUse(name.to_string()));
        }
        Ok(())
    }

    fn disconnect(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.connected.remove(name);
        drop(state);
        self.window.notify_all();
        Ok(())
    }

    fn request_available_names(&self, _name: &str) -> Result<Vec<String>, Error> {
        Ok(self.symbols.clone())
    }

    fn request_new_sequence(&self, _name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.force = true;
        drop(state);
        self.window.notify_all();
        Ok(())
    }

    fn wait_for_data_access(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        loop {
            if !state.connected.contains(name) {
                return Err(Error::Transport("client is not connected".to_string()));
            }

            if let Some(next) = state.queue.pop_front() {
                state.current = Some(next);
                state.force = false;
                return Ok(());
            }

            // A forced sequence re-serves the current acquisition, which is
            // how a stopped scope yields its stored data.
            if state.force {
                state.force = false;
                return Ok(());
            }

            state = self.window.wait(state).unwrap();
        }
    }

    fn finished_with_data_access(&self, _name: &str) -> Result<(), Error> {
        self.windows_served.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

impl NativeDataService for FakeScope {
    fn get_header(&self, request: &WaveformRequest) -> Result<WaveformHeader, Error> {
        let state = self.state.lock().unwrap();
        let found = state.current.as_ref().and_then(|acq| {
            acq.headers
                .iter()
                .find(|h| h.sourcename.eq_ignore_ascii_case(&request.sourcename))
                .cloned()
        });

        // Unknown sources get an empty header, like the real server.
        Ok(found.unwrap_or_else(|| WaveformHeader {
            sourcename: request.sourcename.clone(),
            ..Default::default()
        }))
    }

    fn get_waveform(&self, request: &WaveformRequest) -> Result<ChunkStream, Error> {
        self.get_waveform_calls.fetch_add(1, Ordering::AcqRel);

        let state = self.state.lock().unwrap();
        let payload = state
            .current
            .as_ref()
            .and_then(|acq| acq.payloads.get(&request.sourcename.to_lowercase()))
            .cloned()
            .unwrap_or_default();

        let chunksize = request.chunksize.max(1) as usize;
        let chunks: Vec<Result<Vec<u8>, Error>> = payload
            .chunks(chunksize)
            .map(|c| Ok(c.to_vec()))
            .collect();
        Ok(Box::new(chunks.into_iter()))
    }
}

pub fn analog_header(name: &str, dataid: u64, noofsamples: u64) -> WaveformHeader {
    WaveformHeader {
        sourcename: name.to_string(),
        dataid,
        hasdata: true,
        noofsamples,
        sourcewidth: 1,
        wfmtype: 1,
        verticalspacing: 0.004,
        verticaloffset: 0.0,
        verticalunits: "V".to_string(),
        horizontalspacing: 1e-9,
        horizontal_units: "s".to_string(),
        horizontalzeroindex: noofsamples as f64 / 2.0,
        ..Default::default()
    }
}

pub fn digital_header(name: &str, dataid: u64, noofsamples: u64) -> WaveformHeader {
    WaveformHeader {
        wfmtype: 4,
        verticalspacing: 0.0,
        ..analog_header(name, dataid, noofsamples)
    }
}

pub fn iq_header(name: &str, dataid: u64, noofsamples: u64, window_type: &str) -> WaveformHeader {
    WaveformHeader {
        wfmtype: 6,
        iq_center_frequency: 1e9,
        iq_fft_length: 1024.0,
        iq_rbw: 1e6,
        iq_span: 2e6,
        iq_window_type: window_type.to_string(),
        ..analog_header(name, dataid, noofsamples)
    }
}

/// 8-bit sine payload of the requested length.
pub fn sine_i8(noofsamples: usize) -> Vec<u8> {
    (0..noofsamples)
        .map(|i| (((i as f64) * 0.05).sin() * 100.0) as i8 as u8)
        .collect()
}

/// Polls `cond` until it holds or the timeout elapses.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

use std::collections::HashMap;
use std::sync::Arc;

use crate::acq::filter::HeaderMap;
use crate::wfm::Waveform;
use crate::wire::WaveformHeader;

/// Most recent accepted acquisition: per-source waveforms plus the header
/// map that produced them. Entries are overwritten in place, never
/// versioned; callers keep a waveform past its acquisition by cloning the
/// `Arc` before the access scope ends.
#[derive(Default)]
pub(crate) struct Snapshot {
    waveforms: HashMap<String, Arc<Waveform>>,
    headers: HeaderMap,
}

impl Snapshot {
    pub(crate) fn get(&self, name: &str) -> Option<Arc<Waveform>> {
        self.waveforms.get(&name.to_lowercase()).cloned()
    }

    pub(crate) fn header(&self, name: &str) -> Option<WaveformHeader> {
        self.headers.get(&name.to_lowercase()).cloned()
    }

    pub(crate) fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waveforms.is_empty()
    }

    /// Commits one accepted acquisition. Keys are already lowercase; the
    /// header map is replaced wholesale so all sources move together.
    pub(crate) fn publish(&mut self, decoded: Vec<(String, Arc<Waveform>)>, headers: HeaderMap) {
        for (name, waveform) in decoded {
            self.waveforms.insert(name, waveform);
        }
        self.headers = headers;
    }

    /// Records the headers of a rejected acquisition so the next filter
    /// comparison runs against the latest seen settings.
    pub(crate) fn replace_headers(&mut self, headers: HeaderMap) {
        self.headers = headers;
    }
}

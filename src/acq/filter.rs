use std::collections::HashMap;

use crate::wire::WaveformHeader;

/// Valid headers of one acquisition, keyed by lowercase source name.
pub type HeaderMap = HashMap<String, WaveformHeader>;

/// Acceptance predicate over (previous, current) header maps. Returning
/// false drops the acquisition before any payload is read.
pub type AcqFilter = Box<dyn Fn(&HeaderMap, &HeaderMap) -> bool + Send>;

/// Accepts every acquisition. This is the default filter; it ignores both
/// header maps by design.
pub fn any_acq(_previous: &HeaderMap, _current: &HeaderMap) -> bool {
    true
}

/// Accepts only acquisitions whose horizontal settings changed, or which
/// introduce a source not seen before.
pub fn any_horizontal_change(previous: &HeaderMap, current: &HeaderMap) -> bool {
    for (key, cur) in current {
        match previous.get(key) {
            None => return true,
            Some(prev) => {
                if prev.noofsamples != cur.noofsamples
                    || prev.horizontalspacing != cur.horizontalspacing
                    || prev.horizontalzeroindex != cur.horizontalzeroindex
                {
                    return true;
                }
            }
        }
    }
    false
}

/// Accepts only acquisitions whose vertical settings changed, or which
/// introduce a source not seen before.
pub fn any_vertical_change(previous: &HeaderMap, current: &HeaderMap) -> bool {
    for (key, cur) in current {
        match previous.get(key) {
            None => return true,
            Some(prev) => {
                if prev.verticalspacing != cur.verticalspacing
                    || prev.verticaloffset != cur.verticaloffset
                {
                    return true;
                }
            }
        }
    }
    false
}

//! Call-site capture and decoding for detail-level tracking.
//!
//! In detail mode each event record carries the address of the code location
//! that performed the memory operation, as supplied by the embedding runtime.
//! Decoding is best-effort: addresses render as hex, and a small cache keeps
//! repeated lookups cheap. The cache is torn down when tracking shuts down.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::LazyLock;

use parking_lot::Mutex;

/// The code address a memory operation was issued from.
///
/// Only present in detail mode; summary mode records no call sites.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct CallSite(NonZeroUsize);

impl CallSite {
    /// Wraps a caller address. Returns `None` for a null address.
    #[must_use]
    pub fn new(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(Self)
    }

    /// The raw caller address.
    #[must_use]
    pub fn addr(&self) -> usize {
        self.0.get()
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0.get())
    }
}

/// Whether this platform supports walking the native stack, which is what
/// makes detail-level tracking meaningful.
#[must_use]
pub(crate) fn can_walk_stack() -> bool {
    cfg!(any(target_os = "linux", target_os = "macos", target_os = "windows"))
}

// Decoded strings are cached because reports tend to decode the same handful
// of call sites over and over.
static DECODE_CACHE: LazyLock<Mutex<HashMap<usize, String>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Renders a call site for report output.
pub(crate) fn decode(site: CallSite) -> String {
    let mut cache = DECODE_CACHE.lock();
    cache
        .entry(site.addr())
        .or_insert_with(|| site.to_string())
        .clone()
}

/// Releases decoder state. Called once during final shutdown.
pub(crate) fn shutdown_decoder() {
    DECODE_CACHE.lock().clear();
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(CallSite: Send, Sync, Copy);

    #[test]
    fn null_address_is_no_call_site() {
        assert!(CallSite::new(0).is_none());
        assert!(CallSite::new(0x4000).is_some());
    }

    #[test]
    fn displays_as_fixed_width_hex() {
        let site = CallSite::new(0xdead_beef).unwrap();
        assert_eq!(site.to_string(), "0x00000000deadbeef");
    }

    #[test]
    fn decode_is_stable_across_calls() {
        let site = CallSite::new(0x1234).unwrap();
        let first = decode(site);
        let second = decode(site);
        assert_eq!(first, second);
    }

    #[test]
    fn decoder_shutdown_clears_cache_without_breaking_decode() {
        let site = CallSite::new(0x5678).unwrap();
        let before = decode(site);
        shutdown_decoder();
        assert_eq!(decode(site), before);
    }
}

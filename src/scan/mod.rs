//! Scanning: what text an entry is matched against, and how keys match it.

mod buffer;
mod matcher;

pub use buffer::{GlobalScanData, ScanBuffer, ScanState, MAX_SCAN_DEPTH};
pub use matcher::{match_key, parse_regex_key, Haystack, KeyMatcher};

use std::collections::BTreeMap;

use chrono::NaiveDate;

pub mod detector;
pub mod fetcher;
pub mod watcher;

pub use detector::Detector;
pub use fetcher::{Fetch, FetchError, Fetcher};
pub use watcher::{CycleOutcome, Watcher};

/// Booking status of a single calendar cell, as rendered by the marker glyph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    /// Fully open.
    Open,
    /// Only a few seats left. Counts as available.
    Limited,
    /// Fully booked or not bookable.
    Closed,
}

impl Mark {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '○' | '◯' | '◎' => Some(Self::Open),
            '△' => Some(Self::Limited),
            '×' | '✕' => Some(Self::Closed),
            _ => None,
        }
    }

    pub fn is_available(self) -> bool {
        matches!(self, Self::Open | Self::Limited)
    }
}

/// Verdict for one page (or one merged cycle).
///
/// `time_slots` only carries dates that actually have slots; it stays empty
/// when slot extraction was not attempted (no date filter).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AvailabilityResult {
    pub has_availability: bool,
    pub time_slots: BTreeMap<NaiveDate, Vec<String>>,
}

impl AvailabilityResult {
    pub fn unavailable() -> Self {
        Self::default()
    }
}

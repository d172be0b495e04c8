//! The SSIM-indexed size map.
//!
//! Each media segment carries a map from perceptual quality (SSIM) to the
//! byte cost of reaching it: total size, the reliable prefix included in that
//! size, the quality level the entry belongs to and how many unreliable
//! frame ranges are required. The map is ordered by ascending SSIM.
//!
//! Manifests may legitimately contain two entries with the same SSIM value
//! (different qualities can meet the same score). Entries are therefore keyed
//! by a composite of the SSIM value and an insertion ordinal, which keeps
//! duplicates distinct without perturbing the value itself.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Composite key: SSIM value plus an insertion ordinal for duplicates.
///
/// Ordering is by value first (`f64::total_cmp`), then by ordinal, so
/// iteration walks entries in ascending perceptual quality.
#[derive(Debug, Clone, Copy)]
pub struct SsimKey {
    value: f64,
    ordinal: u32,
}

impl SsimKey {
    pub fn value(&self) -> f64 {
        self.value
    }
}

impl PartialEq for SsimKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SsimKey {}

impl PartialOrd for SsimKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SsimKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value
            .total_cmp(&other.value)
            .then(self.ordinal.cmp(&other.ordinal))
    }
}

impl fmt::Display for SsimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// One rung of the SSIM ladder for a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SsimEntry {
    /// Total bytes needed to reach this SSIM, reliable prefix included.
    pub size: u64,
    /// The reliable share of `size`.
    pub reliable_size: u64,
    /// Quality level this entry belongs to.
    pub quality: usize,
    /// Number of unreliable frame ranges required for this SSIM.
    pub required_frames: u32,
}

/// SSIM → [`SsimEntry`] map for a single segment, ordered by ascending SSIM.
#[derive(Debug, Clone, Default)]
pub struct SsimMap {
    entries: BTreeMap<SsimKey, SsimEntry>,
}

impl SsimMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, disambiguating a duplicate SSIM value with the next
    /// free ordinal. Returns the key under which the entry was stored.
    pub fn insert(&mut self, ssim: f64, entry: SsimEntry) -> SsimKey {
        let ordinal = self
            .entries
            .keys()
            .filter(|k| k.value.total_cmp(&ssim) == Ordering::Equal)
            .count() as u32;
        let key = SsimKey {
            value: ssim,
            ordinal,
        };
        self.entries.insert(key, entry);
        key
    }

    pub fn get(&self, key: &SsimKey) -> Option<&SsimEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in ascending SSIM order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&SsimKey, &SsimEntry)> {
        self.entries.iter()
    }

    /// The highest-SSIM entry belonging to `quality`.
    pub fn highest_for_quality(&self, quality: usize) -> Option<SsimKey> {
        self.entries
            .iter()
            .rev()
            .find(|(_, e)| e.quality == quality)
            .map(|(k, _)| *k)
    }

    /// The lowest-SSIM entry belonging to `quality`.
    pub fn lowest_for_quality(&self, quality: usize) -> Option<SsimKey> {
        self.entries
            .iter()
            .find(|(_, e)| e.quality == quality)
            .map(|(k, _)| *k)
    }

    /// Number of distinct quality levels present in the map.
    pub fn distinct_qualities(&self) -> usize {
        let mut qualities: Vec<usize> = self.entries.values().map(|e| e.quality).collect();
        qualities.sort_unstable();
        qualities.dedup();
        qualities.len()
    }

    /// True when the map holds exactly one entry for each of `quality_count`
    /// levels. The oscillation clamp only applies in that shape.
    pub fn one_entry_per_quality(&self, quality_count: usize) -> bool {
        self.entries.len() == quality_count && self.distinct_qualities() == quality_count
    }

    /// Rewrite every entry's quality level through `remap`.
    ///
    /// The manifest parser stores a placeholder (the representation bandwidth)
    /// while reading and fixes it up once the full ladder is known.
    pub fn remap_qualities(&mut self, mut remap: impl FnMut(usize) -> usize) {
        for entry in self.entries.values_mut() {
            entry.quality = remap(entry.quality);
        }
    }

    /// Collapse the map to one entry per quality, keeping the entry with the
    /// most required frames (the "no drop" shape: never plan to skip frames
    /// a quality level can carry).
    pub fn reshape_no_drop(&mut self, quality_count: usize) {
        let mut best: Vec<Option<(f64, SsimEntry)>> = vec![None; quality_count];
        for (key, entry) in self.entries.iter().rev() {
            if entry.quality >= quality_count {
                continue;
            }
            let replace = match &best[entry.quality] {
                Some((_, kept)) => kept.required_frames < entry.required_frames,
                None => true,
            };
            if replace {
                best[entry.quality] = Some((key.value(), *entry));
            }
        }
        self.entries.clear();
        for slot in best.into_iter().flatten() {
            self.insert(slot.0, slot.1);
        }
    }

    /// Re-value every entry as "remaining cost given the bytes already on
    /// hand". Entries of the in-progress quality at or above the targeted
    /// SSIM shed the reliable prefix (when the unreliable half is running)
    /// and the downloaded bytes, flooring at one byte. Entries below the
    /// targeted SSIM are left alone so a nearly-finished download does not
    /// look infinitely cheap to abandon.
    pub fn adjusted(
        &self,
        quality: usize,
        min_ssim: f64,
        downloaded: u64,
        unreliable_half: bool,
    ) -> SsimMap {
        let mut adjusted = self.clone();
        for (key, entry) in adjusted.entries.iter_mut() {
            if entry.quality != quality || key.value() < min_ssim {
                continue;
            }
            if unreliable_half {
                entry.size = entry.size.saturating_sub(entry.reliable_size);
            }
            entry.size = if downloaded >= entry.size {
                1
            } else {
                entry.size - downloaded
            };
        }
        adjusted
    }
}

//! Manifest-derived data model.
//!
//! Pure types with no networking concerns: byte ranges and range lists (the
//! two `:range` wire forms), segments with their reliable/unreliable frame
//! partitions, representations and the assembled manifest. Everything here is
//! immutable after parse.

use std::fmt;

use slipstream_abr::SsimMap;

use crate::error::{ClientError, ClientResult};

/// Inclusive byte range `start-end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Parse `"a-b"`, tolerating a `bytes=` prefix.
    pub fn parse(s: &str) -> ClientResult<Self> {
        let s = s.strip_prefix("bytes=").unwrap_or(s);
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| ClientError::invalid_manifest(format!("bad byte range '{s}'")))?;
        let start = start
            .trim()
            .parse()
            .map_err(|_| ClientError::invalid_manifest(format!("bad range start '{start}'")))?;
        let end = end
            .trim()
            .parse()
            .map_err(|_| ClientError::invalid_manifest(format!("bad range end '{end}'")))?;
        if end < start {
            return Err(ClientError::invalid_manifest(format!(
                "inverted byte range '{s}'"
            )));
        }
        Ok(Self { start, end })
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Ordered list of byte ranges; the csv payload of a `multibytes=` request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeList {
    ranges: Vec<ByteRange>,
}

impl RangeList {
    pub fn new(ranges: Vec<ByteRange>) -> Self {
        Self { ranges }
    }

    /// Parse a `"a1-b1,a2-b2,…"` csv; the empty string is the empty list.
    pub fn parse(s: &str) -> ClientResult<Self> {
        if s.is_empty() {
            return Ok(Self::default());
        }
        let ranges = s
            .split(',')
            .map(ByteRange::parse)
            .collect::<ClientResult<Vec<_>>>()?;
        Ok(Self { ranges })
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ByteRange> {
        self.ranges.iter()
    }

    pub fn push(&mut self, range: ByteRange) {
        self.ranges.push(range);
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Total bytes covered.
    pub fn total_bytes(&self) -> u64 {
        self.ranges.iter().map(ByteRange::len).sum()
    }

    /// Split into the first `count` ranges and the remainder.
    ///
    /// Asking for more ranges than exist is a manifest error: the required
    /// frame count came from the same manifest as the list itself.
    pub fn split_required(&self, count: usize) -> ClientResult<(RangeList, RangeList)> {
        if count > self.ranges.len() {
            return Err(ClientError::invalid_manifest(format!(
                "{count} required ranges requested from a list of {}",
                self.ranges.len()
            )));
        }
        let (required, optional) = self.ranges.split_at(count);
        Ok((
            RangeList::new(required.to_vec()),
            RangeList::new(optional.to_vec()),
        ))
    }
}

impl fmt::Display for RangeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{range}")?;
        }
        Ok(())
    }
}

/// One media segment of a representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Byte extent of the whole segment in the media file.
    pub media_range: ByteRange,
    /// Frame ranges that must arrive reliably.
    pub reliable_frames: RangeList,
    /// Frame ranges served over the unreliable flag.
    pub unreliable_frames: RangeList,
    pub total_size: u64,
    pub reliable_size: u64,
    pub unreliable_size: u64,
    /// File offset the segment starts at; frame ranges are absolute.
    pub start_offset: u64,
}

impl Segment {
    /// Check the frame-partition invariants: the sizes add up and the two
    /// frame lists tile the segment extent exactly.
    pub fn validate(&self) -> ClientResult<()> {
        if self.total_size != self.reliable_size + self.unreliable_size {
            return Err(ClientError::invalid_manifest(format!(
                "segment at {} sizes do not add up ({} != {} + {})",
                self.start_offset, self.total_size, self.reliable_size, self.unreliable_size
            )));
        }
        let mut covered: Vec<ByteRange> = self
            .reliable_frames
            .iter()
            .chain(self.unreliable_frames.iter())
            .copied()
            .collect();
        covered.sort_by_key(|r| r.start);
        let mut expected = self.start_offset;
        for range in &covered {
            if range.start != expected {
                return Err(ClientError::invalid_manifest(format!(
                    "segment at {} has a frame gap at byte {expected}",
                    self.start_offset
                )));
            }
            expected = range.end + 1;
        }
        if expected != self.start_offset + self.total_size {
            return Err(ClientError::invalid_manifest(format!(
                "segment at {} frames cover {} of {} bytes",
                self.start_offset,
                expected - self.start_offset,
                self.total_size
            )));
        }
        Ok(())
    }
}

/// One representation (quality level) of the adaptation set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Representation {
    /// Advertised bandwidth in kbps.
    pub bandwidth_kbps: u32,
    /// Media file the segment ranges index into.
    pub base_url: String,
    /// Segment 0 is the initialization segment.
    pub segments: Vec<Segment>,
}

/// The parsed manifest: representations ascending by bitrate, per-segment
/// SSIM maps and session-wide timing.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub representations: Vec<Representation>,
    /// Per-quality representation-average SSIM, ascending with bitrate.
    pub avg_ssims: Vec<f64>,
    /// One map per media segment (index 0 is media segment 1).
    pub ssim_maps: Vec<SsimMap>,
    pub segment_duration_ms: u64,
}

impl Manifest {
    /// The bitrate ladder in kbps, ascending.
    pub fn bitrates(&self) -> Vec<f64> {
        self.representations
            .iter()
            .map(|r| r.bandwidth_kbps as f64)
            .collect()
    }

    /// Number of entries per representation, init segment included.
    pub fn segment_count(&self) -> usize {
        self.representations
            .first()
            .map(|r| r.segments.len())
            .unwrap_or(0)
    }

    /// Per-quality total sizes of media segment `index`, in bits.
    pub fn segment_sizes_bits(&self, index: usize) -> Vec<f64> {
        self.representations
            .iter()
            .map(|r| r.segments[index].total_size as f64 * 8.0)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("100-199", 100, 199)]
    #[case("bytes=0-789", 0, 789)]
    #[case("0-0", 0, 0)]
    fn byte_range_parses_both_wire_forms(
        #[case] input: &str,
        #[case] start: u64,
        #[case] end: u64,
    ) {
        assert_eq!(ByteRange::parse(input).unwrap(), ByteRange::new(start, end));
    }

    #[rstest]
    #[case("200-100")]
    #[case("717")]
    #[case("a-b")]
    fn malformed_byte_ranges_are_rejected(#[case] input: &str) {
        assert!(ByteRange::parse(input).is_err());
    }

    #[test]
    fn range_list_round_trips_through_the_csv_form() {
        let csv = "500-999,2000-2499,3000-3999";
        let list = RangeList::parse(csv).unwrap();
        assert_eq!(list.to_string(), csv);
        assert_eq!(RangeList::parse("").unwrap().to_string(), "");
        assert_eq!(list.total_bytes(), 500 + 500 + 1000);
    }

    #[test]
    fn split_required_partitions_the_list() {
        let list = RangeList::parse("0-9,10-19,20-29").unwrap();
        let (required, optional) = list.split_required(2).unwrap();
        assert_eq!(required.to_string(), "0-9,10-19");
        assert_eq!(optional.to_string(), "20-29");

        let (all, none) = list.split_required(3).unwrap();
        assert_eq!(all.len(), 3);
        assert!(none.is_empty());

        let (none, all) = list.split_required(0).unwrap();
        assert!(none.is_empty());
        assert_eq!(all.len(), 3);

        assert!(list.split_required(4).is_err());
    }

    #[test]
    fn segment_validation_requires_an_exact_tiling() {
        let good = Segment {
            media_range: ByteRange::new(1000, 1999),
            reliable_frames: RangeList::parse("1000-1099,1500-1599").unwrap(),
            unreliable_frames: RangeList::parse("1100-1499,1600-1999").unwrap(),
            total_size: 1000,
            reliable_size: 200,
            unreliable_size: 800,
            start_offset: 1000,
        };
        good.validate().unwrap();

        let gap = Segment {
            unreliable_frames: RangeList::parse("1100-1499,1700-1999").unwrap(),
            ..good.clone()
        };
        assert!(gap.validate().is_err());

        let bad_sizes = Segment {
            reliable_size: 300,
            ..good
        };
        assert!(bad_sizes.validate().is_err());
    }
}

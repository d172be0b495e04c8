//! Loss accounting.
//!
//! A multibyte request concatenates scattered frame ranges into one body, so
//! losses reported in body coordinates have to be translated back into the
//! reconstructed segment's coordinate system. This module builds the
//! body↔segment mapping for a request, splices received bytes into the
//! segment body, and turns a frame-timing map into the canonical hole-range
//! csv for the next refill round.

use crate::model::{ByteRange, RangeList};
use crate::transport::FrameTimings;

/// Mapping of one requested range: where its bytes land in the segment body
/// (`to_*`) and where they sit in the response body (`from_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOrder {
    pub to_start: u64,
    pub to_len: u64,
    pub from_start: u64,
    pub from_len: u64,
}

/// Build the body↔segment mapping for a range list requested in order.
/// `offset` is the segment's start offset in the media file; the ranges are
/// absolute file coordinates.
pub fn frame_order(ranges: &RangeList, offset: u64) -> Vec<FrameOrder> {
    let mut order = Vec::with_capacity(ranges.len());
    let mut from = 0u64;
    for range in ranges.iter() {
        let len = range.len();
        order.push(FrameOrder {
            to_start: range.start - offset,
            to_len: len,
            from_start: from,
            from_len: len,
        });
        from += len;
    }
    order
}

/// Copy response bytes to their segment-body positions.
///
/// The response must already be padded to the requested length; the mapping
/// is clamped defensively so a short body can never splice out of bounds.
pub fn splice_body(segment_body: &mut [u8], response_body: &[u8], order: &[FrameOrder]) {
    for entry in order {
        let from_start = entry.from_start as usize;
        let to_start = entry.to_start as usize;
        let len = (entry.from_len as usize)
            .min(response_body.len().saturating_sub(from_start))
            .min(segment_body.len().saturating_sub(to_start));
        if len == 0 {
            continue;
        }
        segment_body[to_start..to_start + len]
            .copy_from_slice(&response_body[from_start..from_start + len]);
    }
}

/// Losses of one request translated into segment coordinates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossInfo {
    /// Hole ranges in media-file coordinates, canonical csv order.
    pub hole_range: RangeList,
    /// The `[loss]` report line body (`" pos,len"` pairs).
    pub report: String,
    /// Total lost bytes.
    pub loss_size: u64,
}

impl LossInfo {
    pub fn is_empty(&self) -> bool {
        self.hole_range.is_empty()
    }
}

/// Translate per-frame losses into hole ranges in the output coordinate
/// system. A loss that straddles several requested ranges is split at each
/// range boundary.
pub fn generate_loss_information(
    timings: &FrameTimings,
    offset: u64,
    order: &[FrameOrder],
) -> LossInfo {
    let mut info = LossInfo {
        report: String::from("[loss]"),
        ..Default::default()
    };
    let Some(first_offset) = timings.keys().next().copied() else {
        return info;
    };

    for (stream_offset, timing) in timings {
        if !timing.was_lost {
            continue;
        }
        let loss_pos = stream_offset - first_offset;
        let loss_len = timing.length;
        info.loss_size += loss_len;

        let Some(start_index) = order
            .iter()
            .position(|e| e.from_start <= loss_pos && loss_pos < e.from_start + e.from_len)
        else {
            continue;
        };
        let mut remaining = loss_len;
        for entry in &order[start_index..] {
            if remaining == 0 {
                break;
            }
            let range_end = entry.from_start + entry.from_len;
            // A loss starting inside the range begins there; one carried
            // over from a previous range begins at the range start.
            let loss_offset_in_request = loss_pos.max(entry.from_start);
            let possible_in_range = range_end - loss_offset_in_request;
            let actual_in_range = remaining.min(possible_in_range);
            let loss_offset_in_range = loss_offset_in_request - entry.from_start;
            let out = offset + entry.to_start + loss_offset_in_range;
            info.hole_range
                .push(ByteRange::new(out, out + actual_in_range - 1));
            info.report
                .push_str(&format!(" {out},{actual_in_range}"));
            remaining -= actual_in_range;
        }
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FrameTiming;

    fn timings(entries: &[(u64, u64, bool)]) -> FrameTimings {
        let mut map = FrameTimings::new();
        for (offset, length, lost) in entries {
            map.insert(
                *offset,
                FrameTiming {
                    arrival_ms: if *lost { None } else { Some(*offset / 10) },
                    length: *length,
                    was_lost: *lost,
                },
            );
        }
        map
    }

    #[test]
    fn frame_order_walks_the_response_body() {
        let ranges = RangeList::parse("1000-1499,2000-2999").unwrap();
        let order = frame_order(&ranges, 1000);
        assert_eq!(
            order,
            vec![
                FrameOrder {
                    to_start: 0,
                    to_len: 500,
                    from_start: 0,
                    from_len: 500
                },
                FrameOrder {
                    to_start: 1000,
                    to_len: 1000,
                    from_start: 500,
                    from_len: 1000
                },
            ]
        );
    }

    #[test]
    fn splice_round_trips_the_response_bytes() {
        let ranges = RangeList::parse("1000-1499,2000-2999").unwrap();
        let order = frame_order(&ranges, 1000);
        let response: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        let mut body = vec![0u8; 2000];
        splice_body(&mut body, &response, &order);
        // Reading the spliced positions back yields the original response.
        assert_eq!(&body[0..500], &response[0..500]);
        assert_eq!(&body[1000..2000], &response[500..1500]);
        // The unrequested middle stays untouched.
        assert!(body[500..1000].iter().all(|b| *b == 0));
    }

    #[test]
    fn hole_ranges_for_the_contiguous_case() {
        // 4000-byte unreliable half at offset 0 with two mid-body losses.
        let ranges = RangeList::parse("100-4099").unwrap();
        let order = frame_order(&ranges, 100);
        let map = timings(&[
            (0, 500, false),
            (500, 500, true),
            (1000, 1000, false),
            (2000, 500, true),
            (2500, 1500, false),
        ]);
        let info = generate_loss_information(&map, 100, &order);
        assert_eq!(info.loss_size, 1000);
        assert_eq!(info.hole_range.to_string(), "600-1099,2100-2599");
        assert_eq!(info.report, "[loss] 600,500 2100,500");
    }

    #[test]
    fn a_loss_straddling_ranges_is_split_at_the_boundary() {
        // Two requested ranges of 400 and 600 bytes; a single 500-byte loss
        // starts 200 bytes into the first one.
        let ranges = RangeList::parse("1000-1399,5000-5599").unwrap();
        let order = frame_order(&ranges, 1000);
        let map = timings(&[(0, 200, false), (200, 500, true), (700, 300, false)]);
        let info = generate_loss_information(&map, 1000, &order);
        // 200 bytes fit in the first range (1200-1399); the remaining 300
        // land at the start of the second (5000-5299).
        assert_eq!(info.hole_range.to_string(), "1200-1399,5000-5299");
        assert_eq!(info.loss_size, 500);
    }

    #[test]
    fn loss_accounting_is_idempotent() {
        let ranges = RangeList::parse("0-999,2000-2999").unwrap();
        let order = frame_order(&ranges, 0);
        let map = timings(&[(0, 800, false), (800, 400, true), (1200, 800, false)]);
        let first = generate_loss_information(&map, 0, &order);
        let second = generate_loss_information(&map, 0, &order);
        assert_eq!(first, second);
    }

    #[test]
    fn empty_timing_map_reports_no_holes() {
        let info = generate_loss_information(&FrameTimings::new(), 0, &[]);
        assert!(info.is_empty());
        assert_eq!(info.loss_size, 0);
    }
}

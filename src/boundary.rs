//! Sample-index to segment resolution
//!
//! The compiled timeline is a prefix-sum boundary table `B[0..=n]` with
//! `B[0] = 0` and `B[n]` the total experiment length. Both the stimulus
//! producer and the store writer resolve absolute sample spans against the
//! same table, so output slices and acquired blocks land on the same
//! segments.

use crate::error::{EcaError, Result};

/// One resolved sub-span: `local_start..local_end` within segment `index`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSpan {
    /// Index into the realized timeline (not the unique segment set)
    pub index: usize,
    /// First sample within the segment, inclusive
    pub local_start: usize,
    /// Last sample within the segment, exclusive
    pub local_end: usize,
}

impl SegmentSpan {
    pub fn len(&self) -> usize {
        self.local_end - self.local_start
    }

    pub fn is_empty(&self) -> bool {
        self.local_end == self.local_start
    }
}

/// Resolve an absolute sample span against a boundary table.
///
/// Returns one span when `[start, start + length)` lies inside a single
/// segment, and exactly two when it straddles a boundary. Because the I/O
/// block size never exceeds the shortest segment, a span can straddle at
/// most one boundary; the returned local ranges concatenate to the full
/// request.
///
/// Fails with a range error when the span runs past the final boundary.
pub fn resolve(boundaries: &[u64], start: u64, length: usize) -> Result<Vec<SegmentSpan>> {
    debug_assert!(boundaries.len() >= 2, "boundary table needs >= 1 segment");
    let total = *boundaries.last().unwrap_or(&0);
    let end = start + length as u64;
    if end > total || length == 0 {
        return Err(EcaError::Range { start, end, total });
    }

    // index of the segment containing a sample point
    let segment_of = |sample: u64| boundaries.partition_point(|&b| b <= sample) - 1;

    let first = segment_of(start);
    let last = segment_of(end - 1);

    if first == last {
        let base = boundaries[first];
        Ok(vec![SegmentSpan {
            index: first,
            local_start: (start - base) as usize,
            local_end: (end - base) as usize,
        }])
    } else {
        let split = boundaries[last];
        Ok(vec![
            SegmentSpan {
                index: first,
                local_start: (start - boundaries[first]) as usize,
                local_end: (split - boundaries[first]) as usize,
            },
            SegmentSpan {
                index: last,
                local_start: 0,
                local_end: (end - split) as usize,
            },
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDARIES: &[u64] = &[0, 1_000, 4_000, 9_000];

    #[test]
    fn test_single_segment_span() {
        let spans = resolve(BOUNDARIES, 1_200, 500).unwrap();
        assert_eq!(
            spans,
            vec![SegmentSpan {
                index: 1,
                local_start: 200,
                local_end: 700,
            }]
        );
    }

    #[test]
    fn test_span_ending_exactly_on_boundary_is_single() {
        let spans = resolve(BOUNDARIES, 500, 500).unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].index, 0);
        assert_eq!(spans[0].local_end, 1_000);
    }

    #[test]
    fn test_span_starting_on_boundary() {
        let spans = resolve(BOUNDARIES, 1_000, 500).unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].index, 1);
        assert_eq!(spans[0].local_start, 0);
    }

    #[test]
    fn test_straddling_span_splits_in_two() {
        let spans = resolve(BOUNDARIES, 3_700, 600).unwrap();
        assert_eq!(
            spans,
            vec![
                SegmentSpan {
                    index: 1,
                    local_start: 2_700,
                    local_end: 3_000,
                },
                SegmentSpan {
                    index: 2,
                    local_start: 0,
                    local_end: 300,
                },
            ]
        );
        assert_eq!(spans.iter().map(SegmentSpan::len).sum::<usize>(), 600);
    }

    #[test]
    fn test_full_walk_covers_every_sample_once() {
        let block = 500;
        let total = *BOUNDARIES.last().unwrap();
        let mut covered = 0u64;
        let mut cursor = 0u64;
        while cursor < total {
            let spans = resolve(BOUNDARIES, cursor, block).unwrap();
            assert!(!spans.is_empty() && spans.len() <= 2);
            covered += spans.iter().map(|s| s.len() as u64).sum::<u64>();
            cursor += block as u64;
        }
        assert_eq!(covered, total);
    }

    #[test]
    fn test_out_of_range_is_fatal() {
        assert!(matches!(
            resolve(BOUNDARIES, 8_800, 500),
            Err(EcaError::Range { .. })
        ));
        assert!(resolve(BOUNDARIES, 9_000, 1).is_err());
    }
}

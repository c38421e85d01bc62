//! `Range` header parsing and canonicalization.

use std::ops::Range;

/// One byte-range spec as sent by the client: `from-to`, `from-`, or `-suffix`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RangeSpec {
    pub from: Option<u64>,
    pub to: Option<u64>,
}

/// Parses a `Range` header value.
///
/// Requires the literal `bytes=` prefix. Returns `None` — the whole header is
/// ignored, not an error — when the prefix is missing or any single spec is
/// malformed.
pub fn parse_range(raw: &str) -> Option<Vec<RangeSpec>> {
    let rest = raw.strip_prefix("bytes=")?;
    let mut specs = Vec::new();
    for piece in rest.split(',') {
        let piece = piece.trim();
        let (from, to) = piece.split_once('-')?;
        let from = match from {
            "" => None,
            digits => Some(parse_u64(digits)?),
        };
        let to = match to {
            "" => None,
            digits => Some(parse_u64(digits)?),
        };
        if from.is_none() && to.is_none() {
            return None;
        }
        specs.push(RangeSpec { from, to });
    }
    if specs.is_empty() { None } else { Some(specs) }
}

fn parse_u64(digits: &str) -> Option<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Canonicalizes range specs against a body of `len` bytes.
///
/// Produces a sorted, non-overlapping set of half-open ranges whose union is
/// a subset of `0..len`: specs are resolved to absolute positions, clipped,
/// unsatisfiable ones dropped, and overlapping or touching ranges merged.
/// Canonicalization is idempotent.
pub fn resolve_ranges(specs: &[RangeSpec], len: u64) -> Vec<Range<u64>> {
    let mut resolved: Vec<Range<u64>> = Vec::with_capacity(specs.len());
    for spec in specs {
        let range = match (spec.from, spec.to) {
            (Some(from), Some(to)) => {
                if from > to {
                    continue;
                }
                from..to.saturating_add(1).min(len)
            }
            (Some(from), None) => from..len,
            (None, Some(suffix)) => {
                if suffix == 0 {
                    continue;
                }
                len.saturating_sub(suffix)..len
            }
            (None, None) => continue,
        };
        if range.start >= range.end {
            continue;
        }
        resolved.push(range);
    }

    resolved.sort_by_key(|r| r.start);

    let mut merged: Vec<Range<u64>> = Vec::with_capacity(resolved.len());
    for range in resolved {
        match merged.last_mut() {
            Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_three_forms() {
        let specs = parse_range("bytes=0-99,500-,-200").unwrap();
        assert_eq!(
            specs,
            vec![
                RangeSpec { from: Some(0), to: Some(99) },
                RangeSpec { from: Some(500), to: None },
                RangeSpec { from: None, to: Some(200) },
            ]
        );
    }

    #[test]
    fn missing_prefix_or_bad_spec_ignores_header() {
        assert_eq!(parse_range("0-99"), None);
        assert_eq!(parse_range("items=0-99"), None);
        assert_eq!(parse_range("bytes=0-99,nope"), None);
        assert_eq!(parse_range("bytes=-"), None);
        assert_eq!(parse_range("bytes="), None);
    }

    #[test]
    fn resolve_clips_and_drops() {
        let specs = parse_range("bytes=5-9,50-").unwrap();
        assert_eq!(resolve_ranges(&specs, 20), vec![5..10]);

        let specs = parse_range("bytes=0-1000").unwrap();
        assert_eq!(resolve_ranges(&specs, 100), vec![0..100]);

        let specs = parse_range("bytes=-30").unwrap();
        assert_eq!(resolve_ranges(&specs, 100), vec![70..100]);
        assert_eq!(resolve_ranges(&specs, 10), vec![0..10]);
    }

    #[test]
    fn overlapping_ranges_merge() {
        let specs = parse_range("bytes=0-99,50-149").unwrap();
        assert_eq!(resolve_ranges(&specs, 1000), vec![0..150]);
    }

    #[test]
    fn out_of_order_ranges_sort() {
        let specs = parse_range("bytes=10-11,0-1").unwrap();
        assert_eq!(resolve_ranges(&specs, 20000), vec![0..2, 10..12]);
    }

    #[test]
    fn inverted_spec_is_dropped() {
        let specs = parse_range("bytes=9-5,0-1").unwrap();
        assert_eq!(resolve_ranges(&specs, 100), vec![0..2]);
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let specs = parse_range("bytes=0-49,25-99,200-").unwrap();
        let once = resolve_ranges(&specs, 300);
        let again: Vec<RangeSpec> =
            once.iter().map(|r| RangeSpec { from: Some(r.start), to: Some(r.end - 1) }).collect();
        assert_eq!(resolve_ranges(&again, 300), once);
    }
}

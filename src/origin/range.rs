//! Byte-range parsing for file responses.

/// Outcome of parsing a `Range` header against a file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOutcome {
    /// No range requested; serve the whole file.
    Full,
    /// Serve the inclusive byte range `(start, end)` with 206.
    Partial(u64, u64),
    /// Malformed or out-of-range; respond 416.
    Invalid,
}

/// Parse a single `bytes=a-b` range.
///
/// `a` defaults to 0 and `b` to `size - 1`; the range must satisfy
/// `0 ≤ a ≤ b < size`. Multi-range requests and any other syntax are
/// invalid.
pub fn parse_range(header: Option<&str>, size: u64) -> RangeOutcome {
    let Some(header) = header else {
        return RangeOutcome::Full;
    };
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return RangeOutcome::Invalid;
    };
    if spec.contains(',') {
        return RangeOutcome::Invalid;
    }
    let Some((start_raw, end_raw)) = spec.split_once('-') else {
        return RangeOutcome::Invalid;
    };

    let start = if start_raw.trim().is_empty() {
        0
    } else {
        match start_raw.trim().parse::<u64>() {
            Ok(v) => v,
            Err(_) => return RangeOutcome::Invalid,
        }
    };
    let end = if end_raw.trim().is_empty() {
        match size.checked_sub(1) {
            Some(v) => v,
            None => return RangeOutcome::Invalid,
        }
    } else {
        match end_raw.trim().parse::<u64>() {
            Ok(v) => v,
            Err(_) => return RangeOutcome::Invalid,
        }
    };

    if start > end || end >= size {
        return RangeOutcome::Invalid;
    }
    RangeOutcome::Partial(start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_header_is_full() {
        assert_eq!(parse_range(None, 100), RangeOutcome::Full);
    }

    #[test]
    fn test_explicit_range() {
        assert_eq!(parse_range(Some("bytes=0-9"), 100), RangeOutcome::Partial(0, 9));
        assert_eq!(parse_range(Some("bytes=10-99"), 100), RangeOutcome::Partial(10, 99));
    }

    #[test]
    fn test_open_ends_default() {
        assert_eq!(parse_range(Some("bytes=50-"), 100), RangeOutcome::Partial(50, 99));
        assert_eq!(parse_range(Some("bytes=-49"), 100), RangeOutcome::Partial(0, 49));
    }

    #[test]
    fn test_inverted_or_overlong_is_invalid() {
        assert_eq!(parse_range(Some("bytes=9-5"), 100), RangeOutcome::Invalid);
        assert_eq!(parse_range(Some("bytes=0-100"), 100), RangeOutcome::Invalid);
        assert_eq!(parse_range(Some("bytes=100-"), 100), RangeOutcome::Invalid);
    }

    #[test]
    fn test_malformed_is_invalid() {
        assert_eq!(parse_range(Some("items=0-5"), 100), RangeOutcome::Invalid);
        assert_eq!(parse_range(Some("bytes=a-b"), 100), RangeOutcome::Invalid);
        assert_eq!(parse_range(Some("bytes=0-5,10-15"), 100), RangeOutcome::Invalid);
    }

    #[test]
    fn test_empty_file_rejects_any_range() {
        assert_eq!(parse_range(Some("bytes=0-0"), 0), RangeOutcome::Invalid);
        assert_eq!(parse_range(Some("bytes=-1"), 0), RangeOutcome::Invalid);
    }
}

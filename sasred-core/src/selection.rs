//! Grid frame selection strings, e.g. `"0-5,8"`.

use crate::{Error, Result};

/// Parse a frame selection string into a sorted, de-duplicated index list.
///
/// The format is a comma-separated list of single indices and inclusive
/// ranges (`"0-5,8,12-14"`). Indices at or beyond `len` are rejected.
///
/// # Errors
/// Returns `Error::InvalidSelection` on malformed input or out-of-range
/// indices.
pub fn parse_selection(selection: &str, len: usize) -> Result<Vec<usize>> {
    let invalid = |reason: &str| Error::InvalidSelection {
        selection: selection.to_string(),
        reason: reason.to_string(),
    };

    let mut indices = Vec::new();
    for part in selection.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(invalid("empty element"));
        }
        if let Some((lo, hi)) = part.split_once('-') {
            let lo: usize = lo
                .trim()
                .parse()
                .map_err(|_| invalid("range start is not a number"))?;
            let hi: usize = hi
                .trim()
                .parse()
                .map_err(|_| invalid("range end is not a number"))?;
            if hi < lo {
                return Err(invalid("range end precedes range start"));
            }
            indices.extend(lo..=hi);
        } else {
            let idx: usize = part.parse().map_err(|_| invalid("not a number"))?;
            indices.push(idx);
        }
    }

    indices.sort_unstable();
    indices.dedup();
    if let Some(&max) = indices.last() {
        if max >= len {
            return Err(invalid(&format!(
                "index {max} out of range for {len} frames"
            )));
        }
    }
    if indices.is_empty() {
        return Err(invalid("selects no frames"));
    }
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ranges_and_singles() {
        assert_eq!(parse_selection("0-5,8", 10).unwrap(), vec![0, 1, 2, 3, 4, 5, 8]);
    }

    #[test]
    fn deduplicates_overlap() {
        assert_eq!(parse_selection("2-4,3,4", 10).unwrap(), vec![2, 3, 4]);
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(parse_selection("0-12", 10).is_err());
    }

    #[test]
    fn rejects_reversed_range() {
        assert!(parse_selection("5-2", 10).is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_selection("a,b", 10).is_err());
        assert!(parse_selection("", 10).is_err());
    }
}

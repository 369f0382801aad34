//! Encoded protocol versions.
//!
//! A version is carried on the wire and stored in the membership directory as
//! a single integer so that min/max aggregation and compatibility checks are
//! cheap. The encoding packs `year.month.patch` as
//! `(year << 12) | (month << 6) | patch`; 0 means unknown/absent.

const MONTH_BITS: u32 = 6;
const YEAR_SHIFT: u32 = 12;
const FIELD_MASK: u32 = 0x3F;

/// Pack version elements into the single-integer encoding.
pub fn encode_version(year: u32, month: u32, patch: u32) -> u32 {
    debug_assert!(year <= FIELD_MASK && month <= FIELD_MASK && patch <= FIELD_MASK);
    (year << YEAR_SHIFT) | (month << MONTH_BITS) | patch
}

/// Parse a `year.month.patch` version string; returns 0 for anything
/// unparseable (an unknown version).
pub fn parse_version(version: &str) -> u32 {
    let mut parts = version.split('.').map(|p| p.parse::<u32>());
    match (parts.next(), parts.next(), parts.next()) {
        (Some(Ok(year)), Some(Ok(month)), Some(Ok(patch)))
            if year <= FIELD_MASK && month <= FIELD_MASK && patch <= FIELD_MASK =>
        {
            encode_version(year, month, patch)
        }
        _ => 0,
    }
}

/// Render an encoded version as `year.month.patch`.
pub fn version_string(encoded: u32) -> String {
    format!(
        "{}.{}.{}",
        encoded >> YEAR_SHIFT,
        (encoded >> MONTH_BITS) & FIELD_MASK,
        encoded & FIELD_MASK
    )
}

/// True iff `actual` is the same `year.month` release as `required` with an
/// equal or higher patch level.
pub fn is_patch_compatible(required: u32, actual: u32) -> bool {
    (required >> MONTH_BITS) == (actual >> MONTH_BITS)
        && (actual & FIELD_MASK) >= (required & FIELD_MASK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_parse_roundtrip() {
        let encoded = encode_version(24, 9, 3);
        assert_eq!(parse_version("24.9.3"), encoded);
        assert_eq!(version_string(encoded), "24.9.3");
    }

    #[test]
    fn test_ordering_follows_release() {
        assert!(encode_version(24, 9, 0) > encode_version(24, 3, 63));
        assert!(encode_version(25, 3, 0) > encode_version(24, 9, 63));
    }

    #[test]
    fn test_unparseable_is_unknown() {
        assert_eq!(parse_version(""), 0);
        assert_eq!(parse_version("abc"), 0);
        assert_eq!(parse_version("24.9"), 0);
        assert_eq!(parse_version("99.99.99"), 0);
    }

    #[test]
    fn test_patch_compatibility() {
        let required = encode_version(24, 9, 2);
        assert!(is_patch_compatible(required, encode_version(24, 9, 2)));
        assert!(is_patch_compatible(required, encode_version(24, 9, 5)));
        assert!(!is_patch_compatible(required, encode_version(24, 9, 1)));
        assert!(!is_patch_compatible(required, encode_version(24, 3, 2)));
    }
}

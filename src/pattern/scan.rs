//! Linear scanning of a memory region for a [`BytePattern`]

use std::slice;

use super::BytePattern;

/// A contiguous, readable range of memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRegion {
    /// First address of the region
    base: usize,
    /// Length of the region in bytes
    len: usize,
}
impl ScanRegion {
    /// Creates a region covering `len` bytes starting at `base`
    ///
    /// # Safety
    ///
    /// The full range `base..base + len` must stay mapped and readable for as long as the region is scanned.
    pub unsafe fn from_raw(base: usize, len: usize) -> Self {
        Self { base, len }
    }

    /// Creates a region covering an existing slice
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            base: data.as_ptr() as usize,
            len: data.len(),
        }
    }

    /// First address of the region
    pub fn base(&self) -> usize {
        self.base
    }

    /// Length of the region in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region covers no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `address` lies inside the region
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address - self.base < self.len
    }

    /// View of the region's bytes
    fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        // Safety: guaranteed readable by whoever constructed the region
        unsafe { slice::from_raw_parts(self.base as *const u8, self.len) }
    }
}

/// Ascending addresses at which a pattern matched.
///
/// An empty set is a normal outcome, distinct from "one or more".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchSet {
    /// Absolute match addresses in scan order
    addresses: Vec<usize>,
}
impl MatchSet {
    /// First match, if any
    pub fn first(&self) -> Option<usize> {
        self.addresses.first().copied()
    }

    /// Number of matches
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// Whether nothing matched
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Iterates over matches in ascending order
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.addresses.iter().copied()
    }

    /// Matches as a slice
    pub fn as_slice(&self) -> &[usize] {
        &self.addresses
    }
}
impl FromIterator<usize> for MatchSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self {
            addresses: iter.into_iter().collect(),
        }
    }
}

/// Scans `region` for every offset at which `pattern` matches.
///
/// Every offset is tried, so overlapping matches are all reported.
/// Worst case is `O(region.len() * pattern.len())`, which is fine for a handful of startup scans.
pub fn scan(region: &ScanRegion, pattern: &BytePattern) -> MatchSet {
    let data = region.as_slice();
    if data.len() < pattern.len() {
        return MatchSet::default();
    }

    data.windows(pattern.len())
        .enumerate()
        .filter(|(_, window)| pattern.matches(window))
        .map(|(offset, _)| region.base() + offset)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a pattern from text
    fn pattern(s: &str) -> BytePattern {
        s.parse().unwrap()
    }

    #[test]
    /// Every match is reported in ascending order, as an absolute address
    fn test_scan_all_matches() {
        let data = [0x90, 0xFF, 0x15, 0x01, 0x90, 0xFF, 0x15, 0x02, 0xFF, 0x15, 0x03];
        let region = ScanRegion::from_slice(&data);
        let matches = scan(&region, &pattern("FF 15 ??"));

        let base = data.as_ptr() as usize;
        assert_eq!(matches.as_slice(), [base + 1, base + 5, base + 8]);
        assert_eq!(matches.first(), Some(base + 1));
        assert!(matches.iter().all(|a| region.contains(a)));
    }

    #[test]
    /// The scan does not skip ahead by the pattern length
    fn test_scan_overlapping() {
        let data = [0xAA; 5];
        let matches = scan(&ScanRegion::from_slice(&data), &pattern("AA ?? AA"));
        let base = data.as_ptr() as usize;
        assert_eq!(matches.as_slice(), [base, base + 1, base + 2]);
    }

    #[test]
    /// Wildcard positions never influence the result
    fn test_scan_wildcard_independent() {
        let pat = pattern("48 ?? 05 ?? ??");
        let mut data = vec![0u8; 64];
        for offset in [3usize, 20, 40] {
            data[offset] = 0x48;
            data[offset + 2] = 0x05;
        }
        let base = data.as_ptr() as usize;
        let expected: Vec<_> = [3usize, 20, 40].iter().map(|o| base + o).collect();

        for fill in [0x00u8, 0x05, 0x48, 0xFF] {
            for offset in [3usize, 20, 40] {
                data[offset + 1] = fill;
                data[offset + 3] = fill;
                data[offset + 4] = fill.wrapping_add(1);
            }
            let matches = scan(&ScanRegion::from_slice(&data), &pat);
            // fills that reproduce the fixed bytes may add matches, never remove them
            assert!(expected.iter().all(|a| matches.as_slice().contains(a)));
            if fill == 0x00 || fill == 0xFF {
                assert_eq!(matches.as_slice(), expected.as_slice());
            }
        }
    }

    #[test]
    /// Regions shorter than the pattern give an empty set rather than an error
    fn test_scan_short_region() {
        let data = [0x48, 0x8B];
        assert!(scan(&ScanRegion::from_slice(&data), &pattern("48 8B 05")).is_empty());
        assert!(scan(&ScanRegion::from_slice(&[]), &pattern("??")).is_empty());
    }

    #[test]
    fn test_scan_no_match() {
        let data = [0u8; 32];
        let matches = scan(&ScanRegion::from_slice(&data), &pattern("C3"));
        assert!(matches.is_empty());
        assert_eq!(matches.first(), None);
    }

    #[test]
    /// Scanning an unmodified region twice gives the same set
    fn test_scan_idempotent() {
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let region = ScanRegion::from_slice(&data);
        let pat = pattern("10 ?? 12");
        assert_eq!(scan(&region, &pat), scan(&region, &pat));
        assert_eq!(scan(&region, &pat).len(), 16);
    }

    #[test]
    /// A match ending exactly at the region end is found
    fn test_scan_tail_match() {
        let data = [0x00, 0x00, 0x5B, 0xC3];
        let matches = scan(&ScanRegion::from_slice(&data), &pattern("5B C3"));
        assert_eq!(matches.as_slice(), [data.as_ptr() as usize + 2]);
    }
}

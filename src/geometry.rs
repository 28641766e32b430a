//! Geometry inference for headerless `.vol` dumps.
//!
//! A `.vol` file carries no self-describing header, so the header size, the
//! sample width and all three dimensions are inferred together from the byte
//! length. Every plausible interpretation becomes a [`Candidate`]; candidates
//! are ranked by [`score`] and the winner is validated against the byte
//! count. The search space is a fixed, enumerable set, so resolution always
//! terminates in bounded time.

use std::cmp::Ordering;
use std::ops::RangeInclusive;

use crate::enums::SampleWidth;
use crate::error::{ConversionError, Result};

/// Header sizes tried, smallest first.
pub const HEADER_OFFSETS: [usize; 5] = [0, 512, 1024, 2048, 4096];

/// Square cross-sections produced by dental CT scanners, largest first.
pub const CROSS_SECTIONS: [usize; 8] = [512, 400, 384, 320, 256, 200, 128, 64];

pub const DEPTH_RANGE: RangeInclusive<usize> = 32..=1024;

/// Hinted cross-sections outside this range are ignored.
pub const HINT_RANGE: RangeInclusive<usize> = 32..=4096;

/// Depths re-tested when a provisional geometry misses the byte count.
pub const CORRECTION_DEPTHS: [usize; 7] = [64, 80, 96, 128, 256, 400, 512];

/// Largest relative mismatch accepted without correction.
pub const ACCEPT_MISMATCH: f64 = 0.10;
/// Largest relative mismatch accepted by the correction pass.
pub const CORRECTION_MISMATCH: f64 = 0.05;

const EXACT_BONUS: i32 = 25;
const HINT_BOOST: i32 = 100;
const HINTED_CROSS_SECTION_PREFERENCE: i32 = 16;

/// Factorizations more elongated than this are rejected.
const MAX_ASPECT: usize = 4;

/// Facts about the volume taken from sidecar metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GeometryHint {
    /// Expected width and height in voxels.
    pub cross_section: Option<usize>,
    /// Isotropic voxel spacing in millimeters.
    pub spacing_mm: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateSource {
    /// Cross-section from the standard table.
    StandardTable,
    /// Cross-section taken from metadata.
    Hinted,
    /// Closest-to-cubic factorization of the voxel count.
    FactorSearch,
    /// Standard cross-section with trailing bytes left over.
    Padded,
    /// Depth replaced by the correction pass.
    Correction,
}

/// One interpretation of a voxel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub header_offset: usize,
    pub sample_width: SampleWidth,
    /// (width, height, depth) in voxels
    pub dimensions: (usize, usize, usize),
    pub source: CandidateSource,
    /// Voxels cover the buffer exactly, with no trailing bytes.
    pub exact: bool,
    /// The cross-section matches the metadata hint.
    pub hinted: bool,
}

impl Candidate {
    /// `None` when the dimensions overflow `usize`.
    pub fn voxel_count(&self) -> Option<usize> {
        let (width, height, depth) = self.dimensions;
        width.checked_mul(height)?.checked_mul(depth)
    }

    pub fn expected_bytes(&self) -> Option<usize> {
        self.voxel_count()?
            .checked_mul(self.sample_width.bytes())?
            .checked_add(self.header_offset)
    }

    /// Relative distance between the expected and the actual byte count.
    pub fn mismatch(&self, total_bytes: usize) -> f64 {
        match self.expected_bytes() {
            Some(expected) if expected > 0 => {
                expected.abs_diff(total_bytes) as f64 / expected as f64
            }
            _ => f64::INFINITY,
        }
    }

    fn cross_section(&self) -> Option<usize> {
        let (width, height, _) = self.dimensions;
        (width == height).then_some(width)
    }

    fn with_depth(&self, depth: usize, source: CandidateSource) -> Self {
        let (width, height, _) = self.dimensions;
        Self {
            dimensions: (width, height, depth),
            source,
            exact: false,
            ..*self
        }
    }
}

/// Confidence score of a candidate; higher is better.
pub fn score(candidate: &Candidate) -> i32 {
    let mut score = candidate.sample_width.preference()
        + cross_section_preference(candidate)
        + depth_plausibility(candidate.dimensions.2);
    if candidate.exact {
        score += EXACT_BONUS;
    }
    if candidate.hinted {
        score += HINT_BOOST;
    }
    score
}

fn cross_section_preference(candidate: &Candidate) -> i32 {
    if candidate.source == CandidateSource::FactorSearch {
        return 0;
    }
    let Some(size) = candidate.cross_section() else {
        return 0;
    };
    match CROSS_SECTIONS.iter().position(|s| *s == size) {
        Some(rank) => 2 * (CROSS_SECTIONS.len() - rank) as i32,
        None if candidate.hinted => HINTED_CROSS_SECTION_PREFERENCE,
        None => 0,
    }
}

fn depth_plausibility(depth: usize) -> i32 {
    match depth {
        128..=512 => 20,
        64..=127 | 513..=768 => 10,
        _ => 0,
    }
}

/// Total order used to pick a winner: score, then smaller header offset,
/// then sample width preference, then larger cross-section.
fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    score(a)
        .cmp(&score(b))
        .then_with(|| b.header_offset.cmp(&a.header_offset))
        .then_with(|| a.sample_width.preference().cmp(&b.sample_width.preference()))
        .then_with(|| a.dimensions.0.cmp(&b.dimensions.0))
        .then_with(|| a.dimensions.1.cmp(&b.dimensions.1))
}

pub fn select(candidates: &[Candidate]) -> Option<Candidate> {
    candidates.iter().copied().max_by(rank)
}

impl GeometryHint {
    /// The hinted cross-section, if it is a size a scanner could produce.
    pub fn plausible_cross_section(&self) -> Option<usize> {
        self.cross_section.filter(|size| HINT_RANGE.contains(size))
    }
}

/// Cross-sections in the order they are tried: the hint first, then the table.
fn cross_sections(hint: &GeometryHint) -> Vec<usize> {
    let hinted = hint.plausible_cross_section();
    let mut sizes = Vec::with_capacity(CROSS_SECTIONS.len() + 1);
    sizes.extend(hinted);
    sizes.extend(CROSS_SECTIONS.iter().filter(|s| Some(**s) != hinted));
    sizes
}

fn source_for(size: usize, hint: &GeometryHint) -> CandidateSource {
    if Some(size) == hint.plausible_cross_section() && !CROSS_SECTIONS.contains(&size) {
        CandidateSource::Hinted
    } else {
        CandidateSource::StandardTable
    }
}

/// Every exact interpretation of a buffer of `total_bytes` bytes.
///
/// Square cross-sections are tried for each header offset and sample width;
/// when none divides the voxel count, the closest-to-cubic factorization
/// stands in for that pair.
pub fn enumerate_candidates(total_bytes: usize, hint: &GeometryHint) -> Vec<Candidate> {
    let sizes = cross_sections(hint);
    let mut candidates = Vec::new();

    for header_offset in HEADER_OFFSETS {
        let Some(remaining) = total_bytes.checked_sub(header_offset) else {
            continue;
        };
        for sample_width in SampleWidth::ALL {
            if remaining == 0 || remaining % sample_width.bytes() != 0 {
                continue;
            }
            let voxel_count = remaining / sample_width.bytes();
            let before = candidates.len();

            for &size in &sizes {
                let Some(slice) = size.checked_mul(size).filter(|s| *s > 0) else {
                    continue;
                };
                if voxel_count % slice != 0 {
                    continue;
                }
                let depth = voxel_count / slice;
                if !DEPTH_RANGE.contains(&depth) {
                    continue;
                }
                candidates.push(Candidate {
                    header_offset,
                    sample_width,
                    dimensions: (size, size, depth),
                    source: source_for(size, hint),
                    exact: true,
                    hinted: Some(size) == hint.plausible_cross_section(),
                });
            }

            if candidates.len() == before
                && let Some(dimensions) = closest_to_cubic(voxel_count)
            {
                candidates.push(Candidate {
                    header_offset,
                    sample_width,
                    dimensions,
                    source: CandidateSource::FactorSearch,
                    exact: true,
                    hinted: false,
                });
            }
        }
    }

    candidates
}

/// Standard cross-sections with whole slices and trailing bytes left over.
fn padded_candidates(total_bytes: usize, hint: &GeometryHint) -> Vec<Candidate> {
    let sizes = cross_sections(hint);
    let mut candidates = Vec::new();

    for header_offset in HEADER_OFFSETS {
        let Some(remaining) = total_bytes.checked_sub(header_offset) else {
            continue;
        };
        for sample_width in SampleWidth::ALL {
            let voxel_count = remaining / sample_width.bytes();
            for &size in &sizes {
                let Some(slice) = size.checked_mul(size).filter(|s| *s > 0) else {
                    continue;
                };
                let depth = voxel_count / slice;
                if !DEPTH_RANGE.contains(&depth) {
                    continue;
                }
                candidates.push(Candidate {
                    header_offset,
                    sample_width,
                    dimensions: (size, size, depth),
                    source: CandidateSource::Padded,
                    exact: false,
                    hinted: Some(size) == hint.plausible_cross_section(),
                });
            }
        }
    }

    candidates
}

fn divisors(n: usize) -> Vec<usize> {
    let mut small = Vec::new();
    let mut large = Vec::new();
    let mut i = 1;
    while i * i <= n {
        if n % i == 0 {
            small.push(i);
            if i * i != n {
                large.push(n / i);
            }
        }
        i += 1;
    }
    small.extend(large.into_iter().rev());
    small
}

/// Factor `voxel_count` into `(width, height, depth)` with
/// `width >= height >= depth`, minimizing `width / depth`.
fn closest_to_cubic(voxel_count: usize) -> Option<(usize, usize, usize)> {
    let divisors = divisors(voxel_count);
    let mut best: Option<(usize, usize, usize)> = None;

    for &depth in &divisors {
        if depth.saturating_mul(depth).saturating_mul(depth) > voxel_count {
            break;
        }
        if !DEPTH_RANGE.contains(&depth) {
            continue;
        }
        let rest = voxel_count / depth;
        for &height in divisors.iter().filter(|h| **h >= depth) {
            if height.saturating_mul(height) > rest {
                break;
            }
            if rest % height != 0 {
                continue;
            }
            let width = rest / height;
            if width > MAX_ASPECT * depth {
                continue;
            }
            let better = match best {
                // width / depth < best_width / best_depth
                Some((best_width, _, best_depth)) => width * best_depth < best_width * depth,
                None => true,
            };
            if better {
                best = Some((width, height, depth));
            }
        }
    }

    best
}

/// The accepted interpretation of a buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    pub candidate: Candidate,
    pub score: i32,
    pub mismatch: f64,
    /// Bytes after the last voxel.
    pub padding_bytes: usize,
    /// Bytes the buffer is short of the expected size; zero-filled on decode.
    pub missing_bytes: usize,
}

impl Resolution {
    fn new(candidate: Candidate, total_bytes: usize) -> Self {
        let expected = candidate.expected_bytes().unwrap_or(usize::MAX);
        Self {
            candidate,
            score: score(&candidate),
            mismatch: candidate.mismatch(total_bytes),
            padding_bytes: total_bytes.saturating_sub(expected),
            missing_bytes: expected.saturating_sub(total_bytes),
        }
    }
}

/// Resolve the geometry of a buffer of `total_bytes` bytes.
///
/// # Errors
///
/// Returns [`ConversionError::UnresolvableGeometry`] when no candidate, even
/// after the correction pass, explains the byte count.
pub fn resolve(total_bytes: usize, hint: &GeometryHint) -> Result<Resolution> {
    let candidates = enumerate_candidates(total_bytes, hint);
    log::debug!(
        "{} exact geometry candidates for {total_bytes} bytes",
        candidates.len()
    );

    let mut provisional = Vec::new();
    match select(&candidates) {
        Some(best) => provisional.push(best),
        None => {
            if let Some(size) = hint.plausible_cross_section() {
                // The scanner reconstructs a cylinder as wide as it is tall.
                provisional.push(Candidate {
                    header_offset: 0,
                    sample_width: SampleWidth::U16,
                    dimensions: (size, size, size),
                    source: CandidateSource::Hinted,
                    exact: false,
                    hinted: true,
                });
            }
            provisional.extend(select(&padded_candidates(total_bytes, hint)));
        }
    }

    for candidate in provisional {
        if let Some(resolution) = validate(candidate, total_bytes) {
            log::info!(
                "Resolved geometry {:?} ({:?}, header {} bytes, score {}, mismatch {:.4})",
                resolution.candidate.dimensions,
                resolution.candidate.sample_width,
                resolution.candidate.header_offset,
                resolution.score,
                resolution.mismatch
            );
            return Ok(resolution);
        }
        log::debug!("Rejected provisional geometry {candidate:?}");
    }

    Err(ConversionError::UnresolvableGeometry { total_bytes })
}

/// Accept `candidate` as is, or attempt one correction pass.
pub fn validate(candidate: Candidate, total_bytes: usize) -> Option<Resolution> {
    if candidate.expected_bytes().is_some_and(|expected| expected <= total_bytes)
        && candidate.mismatch(total_bytes) <= ACCEPT_MISMATCH
    {
        return Some(Resolution::new(candidate, total_bytes));
    }
    correct(candidate, total_bytes)
}

/// Re-test the correction depths holding cross-section, header offset and
/// sample width fixed; the first depth within tolerance wins.
pub fn correct(candidate: Candidate, total_bytes: usize) -> Option<Resolution> {
    log::warn!(
        "Geometry {:?} misses {total_bytes} bytes by {:.1}%, trying depth correction",
        candidate.dimensions,
        candidate.mismatch(total_bytes) * 100.0
    );
    CORRECTION_DEPTHS
        .iter()
        .map(|depth| candidate.with_depth(*depth, CandidateSource::Correction))
        .find(|corrected| corrected.mismatch(total_bytes) <= CORRECTION_MISMATCH)
        .map(|corrected| Resolution::new(corrected, total_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const NO_HINT: GeometryHint = GeometryHint {
        cross_section: None,
        spacing_mm: None,
    };

    fn hint(cross_section: usize) -> GeometryHint {
        GeometryHint {
            cross_section: Some(cross_section),
            spacing_mm: None,
        }
    }

    fn candidate(
        header_offset: usize,
        sample_width: SampleWidth,
        dimensions: (usize, usize, usize),
    ) -> Candidate {
        Candidate {
            header_offset,
            sample_width,
            dimensions,
            source: CandidateSource::StandardTable,
            exact: true,
            hinted: false,
        }
    }

    #[test]
    fn scoring_weights() {
        assert_eq!(score(&candidate(0, SampleWidth::U16, (256, 256, 256))), 83);
        assert_eq!(score(&candidate(0, SampleWidth::U16, (512, 512, 64))), 81);
        assert_eq!(score(&candidate(0, SampleWidth::U8, (512, 512, 128))), 81);
        assert_eq!(score(&candidate(0, SampleWidth::F32, (256, 256, 128))), 63);

        let mut factored = candidate(512, SampleWidth::U16, (257, 256, 255));
        factored.source = CandidateSource::FactorSearch;
        assert_eq!(score(&factored), 75);

        let mut padded = candidate(0, SampleWidth::U16, (256, 256, 256));
        padded.exact = false;
        padded.source = CandidateSource::Padded;
        assert_eq!(score(&padded), 58);
    }

    #[test]
    fn tie_prefers_smallest_header() {
        let a = candidate(1024, SampleWidth::U16, (256, 256, 256));
        let b = candidate(0, SampleWidth::U16, (256, 256, 256));

        assert_eq!(select(&[a, b]), Some(b));
        assert_eq!(select(&[b, a]), Some(b));
    }

    #[test]
    fn cube_256_without_header() {
        let total = 256 * 256 * 256 * 2;
        let resolution = resolve(total, &NO_HINT).unwrap();

        assert_eq!(resolution.candidate.dimensions, (256, 256, 256));
        assert_eq!(resolution.candidate.sample_width, SampleWidth::U16);
        assert_eq!(resolution.candidate.header_offset, 0);
        assert_eq!(resolution.padding_bytes, 0);
        assert_eq!(resolution.mismatch, 0.0);
    }

    #[test]
    fn header_of_1024_bytes_outranks_zero_offset() {
        let total = 512 * 512 * 128 * 2 + 1024;
        let candidates = enumerate_candidates(total, &NO_HINT);
        let best = select(&candidates).unwrap();

        assert_eq!(best.dimensions, (512, 512, 128));
        assert_eq!(best.header_offset, 1024);
        assert_eq!(best.sample_width, SampleWidth::U16);
        assert!(
            candidates
                .iter()
                .filter(|c| c.header_offset == 0)
                .all(|c| score(c) < score(&best))
        );
    }

    #[test]
    fn hint_boosts_matching_cross_section() {
        let total = 256 * 256 * 256 * 2;
        let candidates = enumerate_candidates(total, &hint(256));

        assert_eq!(candidates[0].dimensions, (256, 256, 256));
        assert!(candidates[0].hinted);

        // 512x512x64 explains the same byte count; the hint settles it.
        let best = select(&enumerate_candidates(512 * 512 * 64 * 2, &hint(256))).unwrap();
        assert_eq!(best.dimensions, (256, 256, 256));
    }

    #[test]
    fn non_table_hint_is_tried() {
        let total = 704 * 704 * 400 * 2;
        let best = select(&enumerate_candidates(total, &hint(704))).unwrap();

        assert_eq!(best.dimensions, (704, 704, 400));
        assert_eq!(best.source, CandidateSource::Hinted);
    }

    #[test]
    fn factor_search_finds_near_cube() {
        assert_eq!(closest_to_cubic(100 * 90 * 80), Some((100, 90, 80)));
        assert_eq!(closest_to_cubic(255 * 256 * 257), Some((257, 256, 255)));
        // 65537 is prime; no factorization stays within the aspect limit
        assert_eq!(closest_to_cubic(512 * 65537), None);
    }

    #[test]
    fn non_square_volume_uses_factor_search() {
        let total = 100 * 90 * 80 * 2;
        let resolution = resolve(total, &NO_HINT).unwrap();

        assert_eq!(resolution.candidate.dimensions, (100, 90, 80));
        assert_eq!(resolution.candidate.source, CandidateSource::FactorSearch);
    }

    #[test]
    fn hinted_cylinder_is_corrected_in_depth() {
        let provisional = Candidate {
            header_offset: 0,
            sample_width: SampleWidth::U16,
            dimensions: (704, 704, 704),
            source: CandidateSource::Hinted,
            exact: false,
            hinted: true,
        };
        // 704 wide but only 400 deep, plus a stray trailing byte
        let total = 704 * 704 * 400 * 2 + 1;
        let resolution = validate(provisional, total).unwrap();

        assert_eq!(resolution.candidate.dimensions, (704, 704, 400));
        assert_eq!(resolution.candidate.source, CandidateSource::Correction);
        assert_eq!(resolution.padding_bytes, 1);
        assert_eq!(resolution.missing_bytes, 0);
    }

    #[test]
    fn small_mismatch_needs_no_correction() {
        let provisional = candidate(0, SampleWidth::U16, (256, 256, 256));
        let total = 256 * 256 * 256 * 2 + 4096;
        let resolution = validate(provisional, total).unwrap();

        assert_eq!(resolution.candidate, provisional);
        assert_eq!(resolution.padding_bytes, 4096);
    }

    #[test]
    fn correction_accepts_short_tail() {
        let provisional = candidate(0, SampleWidth::U16, (64, 64, 500));
        let total = 64 * 64 * 80 * 2 - 100;
        let resolution = correct(provisional, total).unwrap();

        assert_eq!(resolution.candidate.dimensions, (64, 64, 80));
        assert_eq!(resolution.missing_bytes, 100);
    }

    #[test]
    fn hinted_buffer_short_of_its_slices_is_corrected() {
        // 96 is off the table; 10 bytes short of 80 slices leaves no exact
        // interpretation, so the hinted cylinder is corrected in depth.
        let total = 96 * 96 * 80 * 2 - 10;
        assert!(enumerate_candidates(total, &hint(96)).is_empty());

        let resolution = resolve(total, &hint(96)).unwrap();

        assert_eq!(resolution.candidate.dimensions, (96, 96, 80));
        assert_eq!(resolution.candidate.source, CandidateSource::Correction);
        assert_eq!(resolution.candidate.sample_width, SampleWidth::U16);
        assert_eq!(resolution.missing_bytes, 10);
        assert_eq!(resolution.padding_bytes, 0);
    }

    #[test]
    fn implausible_hint_is_ignored() {
        let total = 256 * 256 * 256 * 2;

        for size in [usize::MAX, 1 << 40, 5000, 31] {
            let candidates = enumerate_candidates(total, &hint(size));
            assert!(candidates.iter().all(|c| !c.hinted));

            let resolution = resolve(total, &hint(size)).unwrap();
            assert_eq!(resolution.candidate.dimensions, (256, 256, 256));
        }
        assert!(matches!(
            resolve(12_345, &hint(usize::MAX)),
            Err(ConversionError::UnresolvableGeometry { total_bytes: 12_345 })
        ));
    }

    #[test]
    fn oversized_dimensions_do_not_overflow() {
        let huge = candidate(0, SampleWidth::F32, (usize::MAX / 2, 3, 1));

        assert_eq!(huge.voxel_count(), None);
        assert_eq!(huge.expected_bytes(), None);
        assert_eq!(huge.mismatch(1024), f64::INFINITY);
        assert_eq!(validate(huge, 1024), None);
    }

    #[test]
    fn unexplainable_buffer_is_an_error() {
        let result = resolve(12_345, &NO_HINT);

        assert!(matches!(
            result,
            Err(ConversionError::UnresolvableGeometry { total_bytes: 12_345 })
        ));
    }
}

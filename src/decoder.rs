//! Turn a raw `.vol` buffer into a [`VolumeGrid`].

use ndarray::Array3;
use rayon::prelude::*;

use crate::enums::SampleWidth;
use crate::error::{ConversionError, Result};
use crate::geometry::{self, Resolution};
use crate::metadata::PatientMetadata;
use crate::volume::{self, VolumeGeometry, VolumeGrid};

pub const DEFAULT_SPACING_MM: f32 = 1.0;

/// Decode `voxel_bytes` with the default voxel spacing.
///
/// See [`VolumeDecoder::decode`].
pub fn decode(voxel_bytes: &[u8], hint: Option<&PatientMetadata>) -> Result<VolumeGrid> {
    VolumeDecoder::default().decode(voxel_bytes, hint)
}

#[derive(Debug, Clone, Copy)]
pub struct VolumeDecoder {
    default_spacing_mm: f32,
}

impl Default for VolumeDecoder {
    fn default() -> Self {
        Self {
            default_spacing_mm: DEFAULT_SPACING_MM,
        }
    }
}

impl VolumeDecoder {
    /// Spacing used when metadata does not declare one.
    pub fn with_default_spacing(mut self, spacing_mm: f32) -> Self {
        self.default_spacing_mm = spacing_mm;
        self
    }

    /// Resolve the geometry of `voxel_bytes` and materialize the grid.
    ///
    /// Samples are widened to 16 bits: 8-bit samples are multiplied by 257,
    /// float samples are rounded and clamped. A short tail found by the
    /// correction pass is zero-filled.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::UnresolvableGeometry`] when the byte
    /// length cannot be explained.
    pub fn decode(
        &self,
        voxel_bytes: &[u8],
        hint: Option<&PatientMetadata>,
    ) -> Result<VolumeGrid> {
        let hint = hint.map(PatientMetadata::geometry_hint).unwrap_or_default();
        let resolution = geometry::resolve(voxel_bytes.len(), &hint)?;

        let (width, height, depth) = resolution.candidate.dimensions;
        let samples = materialize(voxel_bytes, &resolution);
        let value_range = volume::value_range(&samples).unwrap_or_default();
        let data = Array3::from_shape_vec((depth, height, width), samples).map_err(|_| {
            ConversionError::UnresolvableGeometry {
                total_bytes: voxel_bytes.len(),
            }
        })?;

        let spacing_mm = hint.spacing_mm.unwrap_or(self.default_spacing_mm);
        if resolution.missing_bytes > 0 {
            log::warn!(
                "Volume is {} bytes short, zero-filling the last slices",
                resolution.missing_bytes
            );
        }
        log::info!(
            "Decoded {width}x{height}x{depth} volume, values {}..={}, spacing {spacing_mm} mm",
            value_range.0,
            value_range.1
        );

        let geometry = VolumeGeometry {
            dimensions: (width, height, depth),
            spacing: (spacing_mm, spacing_mm, spacing_mm),
            sample_width: resolution.candidate.sample_width,
            header_offset: resolution.candidate.header_offset,
            value_range,
            score: resolution.score,
            padding_bytes: resolution.padding_bytes,
            missing_bytes: resolution.missing_bytes,
        };
        Ok(VolumeGrid::with_geometry(data, geometry))
    }
}

fn materialize(voxel_bytes: &[u8], resolution: &Resolution) -> Vec<u16> {
    let candidate = &resolution.candidate;
    let sample_bytes = candidate.sample_width.bytes();
    // Resolved candidates always fit in memory; an overflow leaves an empty
    // buffer that fails the shape check.
    let voxel_count = candidate.voxel_count().unwrap_or_default();

    let start = candidate.header_offset.min(voxel_bytes.len());
    let available = (voxel_bytes.len() - start).min(voxel_count.saturating_mul(sample_bytes));
    let body = &voxel_bytes[start..start + available - available % sample_bytes];

    let mut samples: Vec<u16> = match candidate.sample_width {
        SampleWidth::U8 => body.par_iter().map(|&v| u16::from(v) * 257).collect(),
        SampleWidth::U16 => body
            .par_chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect(),
        SampleWidth::F32 => body
            .par_chunks_exact(4)
            .map(|c| float_to_sample(f32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .collect(),
    };
    samples.resize(voxel_count, 0);
    samples
}

#[inline]
fn float_to_sample(value: f32) -> u16 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, f32::from(u16::MAX)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Candidate, CandidateSource};
    use pretty_assertions::assert_eq;

    fn resolution(sample_width: SampleWidth, dimensions: (usize, usize, usize)) -> Resolution {
        Resolution {
            candidate: Candidate {
                header_offset: 2,
                sample_width,
                dimensions,
                source: CandidateSource::StandardTable,
                exact: true,
                hinted: false,
            },
            score: 0,
            mismatch: 0.0,
            padding_bytes: 0,
            missing_bytes: 0,
        }
    }

    #[test]
    fn samples_widen_to_16_bits() {
        let bytes = [0xaa, 0xbb, 0, 1, 255];
        assert_eq!(
            materialize(&bytes, &resolution(SampleWidth::U8, (3, 1, 1))),
            vec![0, 257, 65535]
        );

        let bytes = [0xaa, 0xbb, 0x34, 0x12, 0xff, 0xff];
        assert_eq!(
            materialize(&bytes, &resolution(SampleWidth::U16, (2, 1, 1))),
            vec![0x1234, 0xffff]
        );
    }

    #[test]
    fn floats_are_rounded_and_clamped() {
        let mut bytes = vec![0, 0];
        for v in [12.6f32, -3.0, 1.0e9, f32::NAN] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }

        assert_eq!(
            materialize(&bytes, &resolution(SampleWidth::F32, (4, 1, 1))),
            vec![13, 0, 65535, 0]
        );
    }

    #[test]
    fn short_tail_is_zero_filled() {
        let bytes = [0, 0, 1, 0, 2, 0, 3];
        assert_eq!(
            materialize(&bytes, &resolution(SampleWidth::U16, (2, 2, 1))),
            vec![1, 2, 0, 0]
        );
    }

    #[test]
    fn decodes_cube_with_declared_spacing() {
        let side = 256;
        let bytes: Vec<u8> = (0..side * side * side)
            .flat_map(|i| ((i % 4096) as u16).to_le_bytes())
            .collect();
        let metadata = PatientMetadata {
            parameters: crate::metadata::VolumeParameters {
                voxel_size_mm: Some(crate::metadata::Sourced::declared(0.2)),
                ..Default::default()
            },
            ..Default::default()
        };

        let grid = decode(&bytes, Some(&metadata)).unwrap();

        assert_eq!(grid.dim(), (side, side, side));
        assert_eq!(grid.value_range(), (0, 4095));
        assert_eq!(grid.spacing(), (0.2, 0.2, 0.2));
        assert_eq!(grid.data()[[0, 0, 5]], 5);
        assert_eq!(grid.geometry().sample_width, SampleWidth::U16);
    }

    #[test]
    fn unexplainable_length_fails() {
        let result = VolumeDecoder::default()
            .with_default_spacing(0.5)
            .decode(&[0u8; 999], None);

        assert!(matches!(
            result,
            Err(ConversionError::UnresolvableGeometry { total_bytes: 999 })
        ));
    }
}

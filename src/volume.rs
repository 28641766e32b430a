use crate::enums::{BitDepth, Orientation, SampleWidth};

use image::ImageBuffer;
use image::Luma;
use ndarray::Array3;
use ndarray::ArrayView2;
use ndarray::Axis;
use ndarray::s;
use rayon::prelude::*;
use serde::Serialize;

/// How the voxel buffer was interpreted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeGeometry {
    /// (width, height, depth) in voxels
    pub dimensions: (usize, usize, usize),
    /// (x, y, z) voxel spacing in millimeters
    pub spacing: (f32, f32, f32),
    pub sample_width: SampleWidth,
    pub header_offset: usize,
    /// Smallest and largest sample over the whole grid.
    pub value_range: (u16, u16),
    /// Score of the winning candidate, 0 when the geometry was read from DICOM headers.
    pub score: i32,
    pub padding_bytes: usize,
    pub missing_bytes: usize,
}

/// Summary of a decoded grid, computed without slicing or encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStats {
    pub total_voxels: usize,
    pub non_zero_voxels: usize,
    /// Size of the 16-bit grid in bytes.
    pub data_size_bytes: usize,
    /// `width×height×depth`
    pub dimensions: String,
}

impl VolumeStats {
    pub fn data_size_mib(&self) -> f64 {
        self.data_size_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// A decoded volume, indexed `[z, y, x]`. Never modified after decoding.
#[derive(Debug, Clone)]
pub struct VolumeGrid {
    data: Array3<u16>,
    geometry: VolumeGeometry,
}

impl VolumeGrid {
    /// Wrap an already decoded 16-bit array, e.g. one assembled from DICOM slices.
    pub fn new(data: Array3<u16>, spacing: (f32, f32, f32)) -> Self {
        let (depth, height, width) = data.dim();
        let value_range =
            value_range(data.as_standard_layout().as_slice().unwrap_or_default())
                .unwrap_or_default();
        let geometry = VolumeGeometry {
            dimensions: (width, height, depth),
            spacing,
            sample_width: SampleWidth::U16,
            header_offset: 0,
            value_range,
            score: 0,
            padding_bytes: 0,
            missing_bytes: 0,
        };
        Self { data, geometry }
    }

    pub(crate) fn with_geometry(data: Array3<u16>, geometry: VolumeGeometry) -> Self {
        Self { data, geometry }
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<u16> {
        &self.data
    }

    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    pub fn spacing(&self) -> (f32, f32, f32) {
        self.geometry.spacing
    }

    pub fn value_range(&self) -> (u16, u16) {
        self.geometry.value_range
    }

    pub fn stats(&self) -> VolumeStats {
        let (width, height, depth) = self.geometry.dimensions;
        let non_zero_voxels = self.data.par_iter().filter(|v| **v > 0).count();
        VolumeStats {
            total_voxels: self.data.len(),
            non_zero_voxels,
            data_size_bytes: self.data.len() * std::mem::size_of::<u16>(),
            dimensions: format!("{width}×{height}×{depth}"),
        }
    }

    /// The grid as headerless little-endian 16-bit samples, x fastest.
    pub fn to_raw_bytes(&self) -> Vec<u8> {
        self.data.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Number of slices along the axis an orientation cuts.
    pub fn slice_count(&self, orientation: Orientation) -> usize {
        self.data.len_of(axis_of(orientation))
    }

    pub fn get_slice_from_axis(
        &self,
        index: usize,
        orientation: &Orientation,
    ) -> Option<ArrayView2<'_, u16>> {
        if !self.is_valid_index(index, orientation) {
            return None;
        }
        let slice_result = match orientation {
            Orientation::Axial => self.data().slice(s![index, .., ..]),
            Orientation::Coronal => self.data().slice(s![.., index, ..]),
            Orientation::Sagittal => self.data().slice(s![.., .., index]),
        };
        Some(slice_result)
    }

    /// Render one slice as an 8-bit preview, rescaled with the volume-wide range.
    pub fn get_image_from_axis(
        &self,
        index: usize,
        orientation: Orientation,
    ) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let slice = self.get_slice_from_axis(index, &orientation)?;
        slice_to_image(&slice, self.geometry.value_range)
    }

    fn is_valid_index(&self, index: usize, orientation: &Orientation) -> bool {
        index < self.slice_count(*orientation)
    }
}

pub(crate) fn axis_of(orientation: Orientation) -> Axis {
    match orientation {
        Orientation::Axial => Axis(0),
        Orientation::Coronal => Axis(1),
        Orientation::Sagittal => Axis(2),
    }
}

/// Linearly map `value` from `range` onto `0..=depth.max_value()`.
///
/// A degenerate range (min == max) maps everything to 0.
#[inline]
pub fn rescale(value: u16, range: (u16, u16), depth: BitDepth) -> u16 {
    let (min, max) = range;
    if max <= min {
        return 0;
    }
    let span = u64::from(max - min);
    let offset = u64::from(value.clamp(min, max) - min);
    ((offset * u64::from(depth.max_value()) + span / 2) / span) as u16
}

fn widen(a: (u16, u16), b: (u16, u16)) -> (u16, u16) {
    (a.0.min(b.0), a.1.max(b.1))
}

/// Smallest and largest sample in one parallel pass.
pub(crate) fn value_range(samples: &[u16]) -> Option<(u16, u16)> {
    samples
        .par_iter()
        .map(|&v| (v, v))
        .reduce_with(widen)
}

fn slice_to_image(
    slice: &ArrayView2<'_, u16>,
    range: (u16, u16),
) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
    let (height, width) = slice.dim();
    let pixel_data: Vec<u8> = slice
        .into_par_iter()
        .map(|&v| rescale(v, range, BitDepth::Eight) as u8)
        .collect();
    ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ramp(depth: usize, height: usize, width: usize) -> VolumeGrid {
        let data = Array3::from_shape_fn((depth, height, width), |(z, y, x)| {
            (z * 100 + y * 10 + x) as u16
        });
        VolumeGrid::new(data, (0.5, 0.5, 1.0))
    }

    #[test]
    fn geometry_is_derived_from_array() {
        let grid = ramp(4, 3, 2);

        assert_eq!(grid.dim(), (4, 3, 2));
        assert_eq!(grid.geometry().dimensions, (2, 3, 4));
        assert_eq!(grid.value_range(), (0, 321));
    }

    #[test]
    fn slices_follow_axes() {
        let grid = ramp(4, 3, 2);

        let axial = grid.get_slice_from_axis(1, &Orientation::Axial).unwrap();
        assert_eq!(axial.dim(), (3, 2));
        assert_eq!(axial[[2, 1]], 121);

        let coronal = grid.get_slice_from_axis(2, &Orientation::Coronal).unwrap();
        assert_eq!(coronal.dim(), (4, 2));
        assert_eq!(coronal[[3, 1]], 321);

        let sagittal = grid.get_slice_from_axis(0, &Orientation::Sagittal).unwrap();
        assert_eq!(sagittal.dim(), (4, 3));
        assert_eq!(sagittal[[1, 2]], 120);
    }

    #[test]
    fn out_of_range_index_has_no_slice() {
        let grid = ramp(4, 3, 2);

        assert!(grid.get_slice_from_axis(4, &Orientation::Axial).is_none());
        assert!(grid.get_slice_from_axis(2, &Orientation::Sagittal).is_none());
        assert!(grid.get_image_from_axis(3, Orientation::Coronal).is_none());
    }

    #[test]
    fn stats_count_non_zero_voxels() {
        let stats = ramp(4, 3, 2).stats();

        assert_eq!(stats.total_voxels, 24);
        assert_eq!(stats.non_zero_voxels, 23);
        assert_eq!(stats.data_size_bytes, 48);
        assert_eq!(stats.dimensions, "2×3×4");
    }

    #[test]
    fn raw_export_is_little_endian_in_memory_order() {
        let raw = ramp(2, 2, 2).to_raw_bytes();

        assert_eq!(raw.len(), 16);
        assert_eq!(&raw[..6], &[0, 0, 1, 0, 10, 0]);
        assert_eq!(&raw[14..], &[111, 0]);
    }

    #[test]
    fn rescale_spans_output_range() {
        let range = (1000, 3000);

        assert_eq!(rescale(1000, range, BitDepth::Eight), 0);
        assert_eq!(rescale(3000, range, BitDepth::Eight), 255);
        assert_eq!(rescale(2000, range, BitDepth::Eight), 128);
        assert_eq!(rescale(3000, range, BitDepth::Sixteen), 65535);
        assert_eq!(rescale(500, range, BitDepth::Eight), 0);
        assert_eq!(rescale(1234, (7, 7), BitDepth::Sixteen), 0);
    }

    #[test]
    fn preview_uses_volume_range() {
        let grid = ramp(4, 3, 2);
        let image = grid.get_image_from_axis(0, Orientation::Axial).unwrap();

        assert_eq!(image.dimensions(), (2, 3));
        assert_eq!(image.get_pixel(0, 0).0, [0]);
        // 21 of 321 maps to 17
        assert_eq!(image.get_pixel(1, 2).0, [17]);
    }
}

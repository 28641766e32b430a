//! Cutting a [`VolumeGrid`] into 2-D slices and stacking them back.

use ndarray::{Array3, ArrayView2, ShapeError};
use ndarray::parallel::prelude::*;

use crate::enums::{BitDepth, Orientation};
use crate::volume::{self, VolumeGrid};

/// One 2-D cut through the volume, pixels stored row-major at full 16-bit
/// precision.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceDescriptor {
    pub orientation: Orientation,
    /// 0-based position along the cut axis.
    pub index: usize,
    pub rows: usize,
    pub columns: usize,
    pub pixels: Vec<u16>,
    /// (row spacing, column spacing) in millimeters
    pub pixel_spacing: (f32, f32),
    /// Spacing along the cut axis.
    pub thickness: f32,
    /// Offset of the slice along the cut axis, in millimeters.
    pub slice_location: f32,
    /// 1-based.
    pub instance_number: u32,
}

impl SliceDescriptor {
    fn from_view(
        view: ArrayView2<'_, u16>,
        orientation: Orientation,
        index: usize,
        spacing: (f32, f32, f32),
    ) -> Self {
        let (rows, columns) = view.dim();
        let (sx, sy, sz) = spacing;
        let (pixel_spacing, thickness) = match orientation {
            Orientation::Axial => ((sy, sx), sz),
            Orientation::Coronal => ((sz, sx), sy),
            Orientation::Sagittal => ((sz, sy), sx),
        };
        let pixels = match view.as_slice() {
            Some(contiguous) => contiguous.to_vec(),
            None => view.iter().copied().collect(),
        };

        Self {
            orientation,
            index,
            rows,
            columns,
            pixels,
            pixel_spacing,
            thickness,
            slice_location: index as f32 * thickness,
            instance_number: index as u32 + 1,
        }
    }

    /// Pixels mapped from the volume-wide `range` onto the output depth.
    pub fn rescaled(&self, range: (u16, u16), depth: BitDepth) -> Vec<u16> {
        self.pixels
            .iter()
            .map(|&v| volume::rescale(v, range, depth))
            .collect()
    }
}

/// Extract every slice along the axis `orientation` cuts, in index order.
///
/// Slices are extracted in parallel; the result has no gaps.
pub fn encode_slices(grid: &VolumeGrid, orientation: Orientation) -> Vec<SliceDescriptor> {
    let spacing = grid.spacing();
    let slices: Vec<SliceDescriptor> = grid
        .data()
        .axis_iter(volume::axis_of(orientation))
        .into_par_iter()
        .enumerate()
        .map(|(index, view)| SliceDescriptor::from_view(view, orientation, index, spacing))
        .collect();

    log::info!("Extracted {} {} slices", slices.len(), orientation.as_str());
    slices
}

/// Stack slices cut along `orientation` back into a `[z, y, x]` array.
///
/// # Errors
///
/// Fails when the slices do not share one shape or `slices` is empty.
pub fn assemble_slices(
    slices: &[SliceDescriptor],
    orientation: Orientation,
) -> Result<Array3<u16>, ShapeError> {
    let views = slices
        .iter()
        .map(|slice| ArrayView2::from_shape((slice.rows, slice.columns), &slice.pixels))
        .collect::<Result<Vec<_>, _>>()?;
    ndarray::stack(volume::axis_of(orientation), &views)
}

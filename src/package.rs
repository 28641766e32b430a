//! Bundling encoded slices and a manifest into the output archive.

use rayon::prelude::*;
use serde::Serialize;

use crate::archive;
use crate::encoder::{SeriesUids, SliceEncoder};
use crate::enums::{Orientation, OutputFormat};
use crate::error::Result;
use crate::metadata::{PatientMetadata, VolumeParameters};
use crate::options::ConversionOptions;
use crate::slice::SliceDescriptor;
use crate::volume::VolumeGeometry;

pub const MANIFEST_NAME: &str = "manifest.json";

/// Summary written next to the slices for downstream tooling.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputManifest {
    /// [width, height, depth]
    pub dimensions: [usize; 3],
    /// [x, y, z] in millimeters
    pub spacing: [f32; 3],
    pub value_range: [u16; 2],
    pub slice_count: usize,
    /// Bytes per stored sample in the source buffer.
    pub sample_width: usize,
    pub header_offset: usize,
    pub padding_bytes: usize,
    /// Bytes the voxel buffer was short by; the last slices are zero-filled.
    pub missing_bytes: usize,
    pub orientation: Orientation,
    pub format: OutputFormat,
    pub bits_per_sample: u16,
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub files: Vec<String>,
    pub patient: PatientMetadata,
    pub parameters: VolumeParameters,
}

/// `slice_001.dcm`, zero padded to at least three digits and wide enough
/// for `count`.
pub fn slice_file_name(index: usize, count: usize, format: OutputFormat) -> String {
    let width = count.to_string().len().max(3);
    format!("slice_{:0width$}.{}", index + 1, format.extension())
}

/// Encode `slices` and write them, plus [`MANIFEST_NAME`], into a new archive.
///
/// Encoding runs in parallel, but entries are written in slice order.
///
/// # Errors
///
/// The first failing slice aborts the whole package with
/// [`ConversionError::SliceEncodingFailure`](crate::ConversionError::SliceEncodingFailure);
/// no partial archive is returned.
pub fn package(
    slices: &[SliceDescriptor],
    metadata: &PatientMetadata,
    geometry: &VolumeGeometry,
    options: &ConversionOptions,
) -> Result<Vec<u8>> {
    let uids = SeriesUids::derive(&options.uid_root, metadata, options.orientation);
    let encoder = SliceEncoder::new(
        metadata,
        geometry,
        options.format,
        options.bit_depth,
        uids.clone(),
    );

    let count = slices.len();
    let mut entries = slices
        .par_iter()
        .enumerate()
        .map(|(position, slice)| {
            let name = slice_file_name(position, count, options.format);
            Ok((name, encoder.encode(slice)?))
        })
        .collect::<Result<Vec<(String, Vec<u8>)>>>()?;

    let manifest = OutputManifest {
        dimensions: [
            geometry.dimensions.0,
            geometry.dimensions.1,
            geometry.dimensions.2,
        ],
        spacing: [geometry.spacing.0, geometry.spacing.1, geometry.spacing.2],
        value_range: [geometry.value_range.0, geometry.value_range.1],
        slice_count: count,
        sample_width: geometry.sample_width.bytes(),
        header_offset: geometry.header_offset,
        padding_bytes: geometry.padding_bytes,
        missing_bytes: geometry.missing_bytes,
        orientation: options.orientation,
        format: options.format,
        bits_per_sample: options.bit_depth.bits(),
        study_instance_uid: uids.study,
        series_instance_uid: uids.series,
        files: entries.iter().map(|(name, _)| name.clone()).collect(),
        patient: metadata.clone(),
        parameters: metadata.parameters.clone(),
    };
    entries.push((MANIFEST_NAME.to_owned(), serde_json::to_vec_pretty(&manifest)?));

    let archive = archive::create_archive(&entries)?;
    log::info!(
        "Packaged {count} {} slices into {} bytes",
        options.format.extension(),
        archive.len()
    );
    Ok(archive)
}

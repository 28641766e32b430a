//! # OVV-volume library
//!
//! This crate converts proprietary dental CT exports into standard DICOM
//! (or PNG) slice series.
//!
//! Scanner exports arrive as ZIP archives holding a headerless `.vol` voxel
//! dump, sidecar metadata files (`ver_ctrl.txt`, `VolumeId.xml`) and
//! assorted viewer binaries. The library
//!  - classifies every archive entry without inflating it,
//!  - parses patient and acquisition metadata from the sidecars,
//!  - infers the volume geometry (header size, sample width and
//!    dimensions) from the byte length of the dump with a scored candidate
//!    search,
//!  - cuts the volume into Axial, Coronal or Sagittal slices, and
//!  - packages the slices plus a `manifest.json` into a new archive.
//!
//! Archives that carry a DICOM series instead of a `.vol` dump are restacked
//! into a volume with [`VolumeLoader`] and sliced the same way.
//!
//! Data-parallel stages (sample widening, slice extraction and slice
//! encoding) run on rayon. The library never touches the filesystem; all
//! inputs and outputs are byte buffers. Progress is reported through the
//! [`log`](https://docs.rs/log) facade.
//!
//! # Examples
//!
//! ## Converting a scanner export
//!
//! ```no_run
//! # use ovv_volume::{ConversionOptions, Converter, Orientation};
//! let container = std::fs::read("CT_20250718.zip").expect("should have read the archive");
//! let converter = Converter::new(
//!     ConversionOptions::default().with_orientation(Orientation::Coronal),
//! );
//! let conversion = converter
//!     .convert_archive(&container)
//!     .expect("should have converted the archive");
//! println!("{:?}", conversion.grid.dim());
//! std::fs::write("slices.zip", &conversion.archive).expect("should have written slices");
//! ```
//!
//! ## Previewing the center of a volume
//!
//! ```no_run
//! # use ovv_volume::{decode, Orientation};
//! let voxels = std::fs::read("CT_0.vol").expect("should have read the volume");
//! let grid = decode(&voxels, None).expect("should have resolved the geometry");
//! let image = grid
//!     .get_image_from_axis(grid.dim().2 / 2, Orientation::Sagittal)
//!     .expect("should have returned image at center of volume");
//! image.save("result.png").expect("should have saved the preview");
//! ```
//!
//! ## Analyzing without converting
//!
//! ```no_run
//! # use ovv_volume::Converter;
//! let container = std::fs::read("CT_20250718.zip").expect("should have read the archive");
//! let analysis = Converter::default()
//!     .analyze_archive(&container)
//!     .expect("should have decoded the archive");
//! println!(
//!     "{}: {} of {} voxels set, {:.2} MiB",
//!     analysis.stats.dimensions,
//!     analysis.stats.non_zero_voxels,
//!     analysis.stats.total_voxels,
//!     analysis.stats.data_size_mib()
//! );
//! ```

pub mod archive;
pub mod decoder;
pub mod encoder;
pub mod enums;
mod error;
pub mod geometry;
pub mod metadata;
pub mod options;
pub mod package;
pub mod pipeline;
pub mod slice;
pub mod volume;
pub mod volume_loader;

pub use archive::{classify, create_archive, inspect};
pub use decoder::{VolumeDecoder, decode};
pub use enums::{BitDepth, ContentKind, Orientation, OutputFormat, SampleWidth, SortBy};
pub use error::{ConversionError, Result};
pub use geometry::GeometryHint;
pub use metadata::{PatientMetadata, decode_text, parse, parse_volume_xml};
pub use options::ConversionOptions;
pub use package::{OutputManifest, package, slice_file_name};
pub use pipeline::{Analysis, Conversion, Converter};
pub use slice::{SliceDescriptor, assemble_slices, encode_slices};
pub use volume::{VolumeGeometry, VolumeGrid, VolumeStats};
pub use volume_loader::{VolumeLoader, VolumeLoaderError};

use serde::{Deserialize, Serialize};

use crate::decoder::DEFAULT_SPACING_MM;
use crate::encoder::DEFAULT_UID_ROOT;
use crate::enums::{BitDepth, Orientation, OutputFormat, SortBy};

/// Settings for one conversion. Every field has a default, so a partial
/// JSON document is enough to configure a [`Converter`](crate::Converter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ConversionOptions {
    pub orientation: Orientation,
    pub format: OutputFormat,
    pub bit_depth: BitDepth,
    /// Isotropic voxel spacing used when no sidecar declares one.
    pub default_spacing_mm: f32,
    /// Root under which study, series and instance UIDs are derived.
    pub uid_root: String,
    /// Slice order for archives that carry a DICOM series.
    pub sort_by: SortBy,
    /// Run data-parallel stages on the global rayon pool; when false
    /// everything runs on one thread.
    pub parallel: bool,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            orientation: Orientation::default(),
            format: OutputFormat::default(),
            bit_depth: BitDepth::default(),
            default_spacing_mm: DEFAULT_SPACING_MM,
            uid_root: DEFAULT_UID_ROOT.to_owned(),
            sort_by: SortBy::default(),
            parallel: true,
        }
    }
}

impl ConversionOptions {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_bit_depth(mut self, bit_depth: BitDepth) -> Self {
        self.bit_depth = bit_depth;
        self
    }

    pub fn with_default_spacing(mut self, spacing_mm: f32) -> Self {
        self.default_spacing_mm = spacing_mm;
        self
    }

    pub fn with_uid_root(mut self, uid_root: impl Into<String>) -> Self {
        self.uid_root = uid_root.into();
        self
    }

    pub fn with_sort_by(mut self, sort_by: SortBy) -> Self {
        self.sort_by = sort_by;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}

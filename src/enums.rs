use serde::{Deserialize, Serialize};

/// Anatomical axis a slice is cut along.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    #[default]
    Axial,
    Coronal,
    Sagittal,
}

impl Orientation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Orientation::Axial => "axial",
            Orientation::Coronal => "coronal",
            Orientation::Sagittal => "sagittal",
        }
    }
}

/// What an archive entry turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentKind {
    VolumeData,
    VolumeMetadataXml,
    VersionControlText,
    Dicom,
    OtherBinary,
    Unknown,
}

impl ContentKind {
    /// Sidecar kinds the metadata parser knows how to read.
    pub fn is_sidecar(&self) -> bool {
        matches!(
            self,
            ContentKind::VolumeMetadataXml | ContentKind::VersionControlText
        )
    }
}

/// Width of one stored sample in a `.vol` dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleWidth {
    /// 8-bit unsigned
    U8,
    /// 16-bit unsigned, little endian
    U16,
    /// 32-bit float, little endian
    F32,
}

impl SampleWidth {
    /// Candidates in preference order.
    pub const ALL: [SampleWidth; 3] = [SampleWidth::U16, SampleWidth::U8, SampleWidth::F32];

    pub fn bytes(&self) -> usize {
        match self {
            SampleWidth::U8 => 1,
            SampleWidth::U16 => 2,
            SampleWidth::F32 => 4,
        }
    }

    /// CT data is conventionally 16-bit, so that width scores highest.
    pub(crate) fn preference(&self) -> i32 {
        match self {
            SampleWidth::U16 => 30,
            SampleWidth::U8 => 20,
            SampleWidth::F32 => 10,
        }
    }
}

/// Image encoding used for each slice inside the output archive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Dicom,
    Png,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Dicom => "dcm",
            OutputFormat::Png => "png",
        }
    }
}

/// Bit depth of the rescaled output samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitDepth {
    #[default]
    Eight,
    Sixteen,
}

impl BitDepth {
    pub fn bits(&self) -> u16 {
        match self {
            BitDepth::Eight => 8,
            BitDepth::Sixteen => 16,
        }
    }

    pub fn max_value(&self) -> u16 {
        match self {
            BitDepth::Eight => u8::MAX as u16,
            BitDepth::Sixteen => u16::MAX,
        }
    }
}

/// Ordering applied to DICOM slices when an archive carries a DICOM series
/// instead of a `.vol` dump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    ImagePositionPatient,
    TablePosition,
    #[default]
    InstanceNumber,
    None,
}

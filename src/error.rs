use thiserror::Error;

use crate::volume_loader::VolumeLoaderError;

#[derive(Debug, Error)]
pub enum ConversionError {
    /// The container's central directory (or one of its entries) could not be read.
    #[error("Archive is corrupt: {0}")]
    ArchiveCorrupt(#[from] zip::result::ZipError),

    #[error("No volume data found in archive")]
    NoVolumeDataFound,

    /// No candidate geometry explains the byte length of the voxel buffer.
    #[error("Unable to resolve volume geometry for {total_bytes} bytes")]
    UnresolvableGeometry { total_bytes: usize },

    /// A slice failed to rescale or serialize; the whole batch is rejected.
    #[error("Failed to encode slice {index}: {reason}")]
    SliceEncodingFailure { index: usize, reason: String },

    #[error("DICOM series error: {0}")]
    DicomSeries(#[from] VolumeLoaderError),

    #[error("Manifest serialization failed: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConversionError {
    /// True when the input decoded fine structurally but holds nothing
    /// convertible, so the caller should ask for a different source file
    /// rather than a re-upload of the same one.
    pub fn is_source_problem(&self) -> bool {
        matches!(
            self,
            ConversionError::UnresolvableGeometry { .. }
                | ConversionError::NoVolumeDataFound
                | ConversionError::DicomSeries(VolumeLoaderError::NoValidImages)
        )
    }
}

pub type Result<T, E = ConversionError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_and_corruption_stay_distinct() {
        let geometry = ConversionError::UnresolvableGeometry { total_bytes: 7 };
        let corrupt = ConversionError::ArchiveCorrupt(zip::result::ZipError::InvalidArchive(
            "bad central directory".into(),
        ));

        assert!(geometry.is_source_problem());
        assert!(!corrupt.is_source_problem());
        assert_eq!(
            geometry.to_string(),
            "Unable to resolve volume geometry for 7 bytes"
        );
    }

    #[test]
    fn unreadable_dicom_series_is_a_source_problem() {
        let unreadable = ConversionError::from(VolumeLoaderError::NoValidImages);
        let inconsistent = ConversionError::from(VolumeLoaderError::InconsistentDimensions);

        assert!(unreadable.is_source_problem());
        assert!(!inconsistent.is_source_problem());
    }
}

//! Archive inspection and creation.
//!
//! Scanner exports arrive as ZIP archives that mix the `.vol` voxel dump with
//! sidecar files, viewer executables and assorted binaries. [`inspect`]
//! classifies every entry without inflating it fully; entry bytes are only
//! materialized when [`Inspection::read`] is called.

use std::io::{self, Cursor, Read, Write};
use std::path::Path;

use serde::Serialize;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::enums::ContentKind;
use crate::error::Result;

/// Bytes needed to sniff every known signature, including the DICOM marker at 128.
const HEAD_LEN: usize = 132;

/// Upper bound on the buffer reserved from a declared entry size; larger
/// entries grow while inflating.
const MAX_PREALLOCATION: usize = 64 << 20;

const DICOM_MAGIC_OFFSET: usize = 128;
const DICOM_MAGIC: &[u8] = b"DICM";

/// Signatures of files that are certainly not volume data.
const BINARY_SIGNATURES: &[&[u8]] = &[
    b"MZ",
    b"\x7fELF",
    b"\xcf\xfa\xed\xfe",
    b"\xca\xfe\xba\xbe",
    b"PK\x03\x04",
    b"%PDF",
    b"\x1f\x8b",
];

/// One classified archive entry. Its bytes stay inside the archive until
/// requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifiedFile {
    pub index: usize,
    pub name: String,
    pub size: u64,
    pub kind: ContentKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InspectionSummary {
    pub total_count: usize,
    pub volume_data_count: usize,
    pub dicom_count: usize,
    pub other_count: usize,
}

pub struct Inspection<'a> {
    archive: ZipArchive<Cursor<&'a [u8]>>,
    files: Vec<ClassifiedFile>,
}

impl<'a> Inspection<'a> {
    pub fn files(&self) -> &[ClassifiedFile] {
        &self.files
    }

    pub fn files_of_kind(&self, kind: ContentKind) -> impl Iterator<Item = &ClassifiedFile> {
        self.files.iter().filter(move |file| file.kind == kind)
    }

    pub fn summary(&self) -> InspectionSummary {
        let volume_data_count = self.files_of_kind(ContentKind::VolumeData).count();
        InspectionSummary {
            total_count: self.files.len(),
            volume_data_count,
            dicom_count: self.files_of_kind(ContentKind::Dicom).count(),
            other_count: self.files.len() - volume_data_count,
        }
    }

    /// Inflate one entry.
    pub fn read(&self, file: &ClassifiedFile) -> Result<Vec<u8>> {
        // Cloning shares the parsed central directory; only the cursor is copied.
        let mut archive = self.archive.clone();
        let mut entry = archive.by_index(file.index)?;
        let mut bytes = Vec::with_capacity(preallocation(file.size));
        entry.read_to_end(&mut bytes).map_err(ZipError::from)?;
        Ok(bytes)
    }
}

/// The declared size comes from the archive and is not trusted.
fn preallocation(declared_size: u64) -> usize {
    usize::try_from(declared_size).map_or(MAX_PREALLOCATION, |size| size.min(MAX_PREALLOCATION))
}

/// Parse the archive index and classify every file entry.
///
/// # Errors
///
/// Returns [`ConversionError::ArchiveCorrupt`](crate::ConversionError::ArchiveCorrupt)
/// when the central directory cannot be parsed.
pub fn inspect(container: &[u8]) -> Result<Inspection<'_>> {
    let mut archive = ZipArchive::new(Cursor::new(container))?;
    let mut files = Vec::with_capacity(archive.len());

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_owned();
        let size = entry.size();

        let mut head = Vec::with_capacity(HEAD_LEN);
        if let Err(err) = (&mut entry).take(HEAD_LEN as u64).read_to_end(&mut head) {
            // An unreadable head only loses magic sniffing; the name still classifies.
            log::warn!("Unable to read header of {name}: {err}");
            head.clear();
        }

        let kind = classify(&name, &head);
        log::debug!("{name}: {kind:?} ({size} bytes)");
        files.push(ClassifiedFile {
            index,
            name,
            size,
            kind,
        });
    }

    let inspection = Inspection { archive, files };
    let summary = inspection.summary();
    log::info!(
        "Inspected archive: {} files, {} volume, {} DICOM",
        summary.total_count,
        summary.volume_data_count,
        summary.dicom_count
    );
    Ok(inspection)
}

/// Classify an entry by its name and leading bytes.
///
/// Extension rules run first, magic sniffing second; anything else is
/// [`ContentKind::Unknown`].
pub fn classify(name: &str, head: &[u8]) -> ContentKind {
    let lower = name.to_lowercase();
    let file_name = Path::new(&lower)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(&lower);
    let extension = Path::new(file_name)
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default();

    match extension {
        "vol" => return ContentKind::VolumeData,
        "xml" if file_name.contains("volumeid") => return ContentKind::VolumeMetadataXml,
        "txt" if file_name.contains("ver_ctrl") => return ContentKind::VersionControlText,
        "dcm" | "dicom" => return ContentKind::Dicom,
        _ => {}
    }

    if head.len() >= DICOM_MAGIC_OFFSET + DICOM_MAGIC.len()
        && &head[DICOM_MAGIC_OFFSET..DICOM_MAGIC_OFFSET + DICOM_MAGIC.len()] == DICOM_MAGIC
    {
        return ContentKind::Dicom;
    }
    if BINARY_SIGNATURES.iter().any(|sig| head.starts_with(sig)) {
        return ContentKind::OtherBinary;
    }

    ContentKind::Unknown
}

/// Write `files` into a new deflate-compressed ZIP archive.
///
/// Write failures surface as [`ConversionError::Io`](crate::ConversionError::Io),
/// never as `ArchiveCorrupt`, which is reserved for unreadable inputs.
pub fn create_archive<N, B>(files: &[(N, B)]) -> Result<Vec<u8>>
where
    N: AsRef<str>,
    B: AsRef<[u8]>,
{
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    for (name, bytes) in files {
        writer
            .start_file(name.as_ref(), options)
            .map_err(io::Error::from)?;
        writer.write_all(bytes.as_ref())?;
    }

    Ok(writer.finish().map_err(io::Error::from)?.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConversionError;

    fn dicom_head() -> Vec<u8> {
        let mut head = vec![0u8; 128];
        head.extend_from_slice(b"DICM");
        head
    }

    #[test]
    fn declared_size_does_not_drive_allocation() {
        assert_eq!(preallocation(4096), 4096);
        assert_eq!(preallocation(u64::MAX), MAX_PREALLOCATION);
        assert_eq!(preallocation(0xffff_fff0), MAX_PREALLOCATION);
    }

    #[test]
    fn extension_table_wins() {
        assert_eq!(classify("CT_2025/CT_0.vol", b""), ContentKind::VolumeData);
        assert_eq!(
            classify("CT_2025/VolumeId.xml", b"<?xml"),
            ContentKind::VolumeMetadataXml
        );
        assert_eq!(classify("ver_ctrl.txt", b"Ver="), ContentKind::VersionControlText);
        assert_eq!(classify("IMG0001.DCM", b""), ContentKind::Dicom);
        assert_eq!(classify("image.dicom", b""), ContentKind::Dicom);
    }

    #[test]
    fn xml_and_txt_need_their_markers() {
        assert_eq!(classify("layout.xml", b"<?xml"), ContentKind::Unknown);
        assert_eq!(classify("readme.txt", b"hello"), ContentKind::Unknown);
    }

    #[test]
    fn magic_bytes_classify_extensionless_entries() {
        assert_eq!(classify("IM000001", &dicom_head()), ContentKind::Dicom);
        assert_eq!(classify("OneVolumeViewer.exe", b"MZ\x90\x00"), ContentKind::OtherBinary);
        assert_eq!(classify("viewer", b"\x7fELF\x02"), ContentKind::OtherBinary);
        assert_eq!(classify("blob.bin", &[0u8; 16]), ContentKind::Unknown);
    }

    #[test]
    fn classification_is_idempotent() {
        for (name, head) in [
            ("CT_0.vol", Vec::new()),
            ("IM1", dicom_head()),
            ("setup.exe", b"MZ".to_vec()),
            ("notes", b"abc".to_vec()),
        ] {
            let first = classify(name, &head);
            assert_eq!(first, classify(name, &head));
        }
    }

    #[test]
    fn inspect_reads_entries_lazily() {
        let archive = create_archive(&[
            ("scan/CT_0.vol", vec![1u8, 2, 3, 4]),
            ("ver_ctrl.txt", b"PatientID=\"42\"".to_vec()),
            ("Viewer.exe", b"MZ rest of binary".to_vec()),
        ])
        .unwrap();

        let inspection = inspect(&archive).unwrap();
        assert_eq!(
            inspection.summary(),
            InspectionSummary {
                total_count: 3,
                volume_data_count: 1,
                dicom_count: 0,
                other_count: 2,
            }
        );

        let volume = inspection
            .files_of_kind(ContentKind::VolumeData)
            .next()
            .unwrap();
        assert_eq!(volume.size, 4);
        assert_eq!(inspection.read(volume).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn garbage_is_archive_corrupt() {
        let result = inspect(b"definitely not a zip archive");
        assert!(matches!(result, Err(ConversionError::ArchiveCorrupt(_))));
    }
}

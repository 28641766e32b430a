//! End-to-end conversion: archive in, slice archive out.

use serde::Serialize;

use crate::archive::{self, ClassifiedFile, Inspection};
use crate::decoder::VolumeDecoder;
use crate::enums::ContentKind;
use crate::error::{ConversionError, Result};
use crate::metadata::{self, Diagnostic, ParsedMetadata, PatientMetadata};
use crate::options::ConversionOptions;
use crate::package;
use crate::slice;
use crate::volume::{VolumeGeometry, VolumeGrid, VolumeStats};
use crate::volume_loader::VolumeLoader;

/// A parse problem together with the sidecar it was found in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SidecarDiagnostic {
    pub file: String,
    pub diagnostic: Diagnostic,
}

/// Result of one conversion.
#[derive(Debug)]
pub struct Conversion {
    pub grid: VolumeGrid,
    pub metadata: PatientMetadata,
    pub diagnostics: Vec<SidecarDiagnostic>,
    /// The packaged slice archive.
    pub archive: Vec<u8>,
}

/// What a source holds, found without slicing or packaging.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub stats: VolumeStats,
    #[serde(skip)]
    pub geometry: VolumeGeometry,
    pub metadata: PatientMetadata,
    pub diagnostics: Vec<SidecarDiagnostic>,
}

impl Analysis {
    fn new(
        grid: &VolumeGrid,
        metadata: PatientMetadata,
        diagnostics: Vec<SidecarDiagnostic>,
    ) -> Self {
        Self {
            stats: grid.stats(),
            geometry: *grid.geometry(),
            metadata,
            diagnostics,
        }
    }
}

/// Runs inspect, parse, decode, slice and package in order. Holds no state
/// between conversions, so one converter can serve many requests.
#[derive(Debug, Clone, Default)]
pub struct Converter {
    options: ConversionOptions,
}

impl Converter {
    pub fn new(options: ConversionOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ConversionOptions {
        &self.options
    }

    /// Convert a scanner export archive.
    ///
    /// The first `.vol` entry by name is decoded; without one, a DICOM
    /// series in the archive is restacked instead.
    ///
    /// # Errors
    ///
    /// * [`ConversionError::ArchiveCorrupt`] when the container is unreadable
    /// * [`ConversionError::NoVolumeDataFound`] when it holds neither a
    ///   `.vol` dump nor DICOM files
    /// * any decode or packaging error of the later stages
    pub fn convert_archive(&self, container: &[u8]) -> Result<Conversion> {
        self.run(|| {
            let (grid, metadata, diagnostics) = self.load_archive(container)?;
            self.finish(grid, metadata, diagnostics)
        })
    }

    /// Convert a bare voxel buffer with optional `(file name, bytes)`
    /// sidecars.
    pub fn convert_volume(
        &self,
        voxel_bytes: &[u8],
        sidecars: &[(&str, &[u8])],
    ) -> Result<Conversion> {
        self.run(|| {
            let (grid, metadata, diagnostics) = self.load_volume(voxel_bytes, sidecars)?;
            self.finish(grid, metadata, diagnostics)
        })
    }

    /// Decode an archive and report voxel statistics and metadata without
    /// producing slices. Fails the same way [`Converter::convert_archive`] does.
    pub fn analyze_archive(&self, container: &[u8]) -> Result<Analysis> {
        self.run(|| {
            let (grid, metadata, diagnostics) = self.load_archive(container)?;
            Ok(Analysis::new(&grid, metadata, diagnostics))
        })
    }

    pub fn analyze_volume(
        &self,
        voxel_bytes: &[u8],
        sidecars: &[(&str, &[u8])],
    ) -> Result<Analysis> {
        self.run(|| {
            let (grid, metadata, diagnostics) = self.load_volume(voxel_bytes, sidecars)?;
            Ok(Analysis::new(&grid, metadata, diagnostics))
        })
    }

    fn load_archive(&self, container: &[u8]) -> Result<Loaded> {
        let inspection = archive::inspect(container)?;
        let (metadata, diagnostics) = read_sidecars(&inspection);

        let mut volumes: Vec<&ClassifiedFile> =
            inspection.files_of_kind(ContentKind::VolumeData).collect();
        volumes.sort_by(|a, b| a.name.cmp(&b.name));

        let grid = match volumes.first() {
            Some(volume) => {
                if volumes.len() > 1 {
                    log::info!(
                        "{} volume files in archive, converting {}",
                        volumes.len(),
                        volume.name
                    );
                }
                let voxel_bytes = inspection.read(volume)?;
                self.decoder().decode(&voxel_bytes, Some(&metadata))?
            }
            None => self.load_dicom_series(&inspection)?,
        };

        Ok((grid, metadata, diagnostics))
    }

    fn load_volume(&self, voxel_bytes: &[u8], sidecars: &[(&str, &[u8])]) -> Result<Loaded> {
        let (metadata, diagnostics) = parse_sidecars(
            sidecars
                .iter()
                .map(|(name, bytes)| (name.to_string(), bytes.to_vec())),
        );
        let grid = self.decoder().decode(voxel_bytes, Some(&metadata))?;
        Ok((grid, metadata, diagnostics))
    }

    fn decoder(&self) -> VolumeDecoder {
        VolumeDecoder::default().with_default_spacing(self.options.default_spacing_mm)
    }

    fn load_dicom_series(&self, inspection: &Inspection<'_>) -> Result<VolumeGrid> {
        let buffers = inspection
            .files_of_kind(ContentKind::Dicom)
            .map(|file| inspection.read(file))
            .collect::<Result<Vec<_>>>()?;
        if buffers.is_empty() {
            return Err(ConversionError::NoVolumeDataFound);
        }

        log::info!("No volume file, restacking {} DICOM files", buffers.len());
        Ok(VolumeLoader::load_from_buffers(&buffers, self.options.sort_by)?)
    }

    fn finish(
        &self,
        grid: VolumeGrid,
        metadata: PatientMetadata,
        diagnostics: Vec<SidecarDiagnostic>,
    ) -> Result<Conversion> {
        let slices = slice::encode_slices(&grid, self.options.orientation);
        let archive = package::package(&slices, &metadata, grid.geometry(), &self.options)?;

        Ok(Conversion {
            grid,
            metadata,
            diagnostics,
            archive,
        })
    }

    /// Run `stage` on the global rayon pool, or on a private single-thread
    /// pool when parallelism is disabled.
    fn run<T, F>(&self, stage: F) -> Result<T>
    where
        T: Send,
        F: FnOnce() -> Result<T> + Send,
    {
        if self.options.parallel {
            return stage();
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .map_err(std::io::Error::other)?;
        pool.install(stage)
    }
}

type Loaded = (VolumeGrid, PatientMetadata, Vec<SidecarDiagnostic>);

fn read_sidecars(inspection: &Inspection<'_>) -> (PatientMetadata, Vec<SidecarDiagnostic>) {
    let sidecars = inspection
        .files()
        .iter()
        .filter(|file| file.kind.is_sidecar())
        .filter_map(|file| match inspection.read(file) {
            Ok(bytes) => Some((file.name.clone(), bytes)),
            Err(err) => {
                log::warn!("Skipping unreadable sidecar {}: {err}", file.name);
                None
            }
        });
    parse_sidecars(sidecars)
}

/// Parse and merge sidecars. Earlier files win for fields declared twice.
fn parse_sidecars(
    sidecars: impl Iterator<Item = (String, Vec<u8>)>,
) -> (PatientMetadata, Vec<SidecarDiagnostic>) {
    let mut metadata = PatientMetadata::default();
    let mut diagnostics = Vec::new();

    for (name, bytes) in sidecars {
        let text = metadata::decode_text(&bytes);
        let ParsedMetadata {
            metadata: parsed,
            diagnostics: found,
        } = match archive::classify(&name, &bytes) {
            ContentKind::VolumeMetadataXml => metadata::parse_volume_xml(&text),
            _ => metadata::parse(&text),
        };
        log::debug!("{name}: {} diagnostics", found.len());

        metadata.merge(parsed);
        diagnostics.extend(found.into_iter().map(|diagnostic| SidecarDiagnostic {
            file: name.clone(),
            diagnostic,
        }));
    }

    (metadata, diagnostics)
}

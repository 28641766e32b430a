//! Per-slice serialization to DICOM CT images or PNG.

use std::io::Cursor;

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use dicom_dictionary_std::{tags, uids};
use image::{ImageBuffer, ImageFormat, Luma};

use crate::enums::{BitDepth, Orientation, OutputFormat};
use crate::error::{ConversionError, Result};
use crate::metadata::PatientMetadata;
use crate::slice::SliceDescriptor;
use crate::volume::VolumeGeometry;

pub const DEFAULT_UID_ROOT: &str = "2.25";

const MODALITY: &str = "CT";
const IMAGE_TYPE: &str = "DERIVED\\SECONDARY";

/// Study, series and frame of reference UIDs shared by every slice of one
/// conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesUids {
    pub study: String,
    pub series: String,
    pub frame_of_reference: String,
}

impl SeriesUids {
    /// Derive stable UIDs from the patient identity so that converting the
    /// same archive twice yields the same study.
    pub fn derive(root: &str, metadata: &PatientMetadata, orientation: Orientation) -> Self {
        let identity = format!(
            "{}|{}|{}|{}",
            metadata.patient_id, metadata.scan_task_id, metadata.photo_date, metadata.patient_name
        );
        let study = format!("{root}.{}", fnv1a(identity.as_bytes()));
        let series_number = series_number(orientation);
        Self {
            series: format!("{study}.{series_number}"),
            frame_of_reference: format!("{study}.0"),
            study,
        }
    }

    pub fn sop_instance(&self, slice: &SliceDescriptor) -> String {
        format!("{}.{}", self.series, slice.instance_number)
    }
}

fn series_number(orientation: Orientation) -> u16 {
    match orientation {
        Orientation::Axial => 1,
        Orientation::Coronal => 2,
        Orientation::Sagittal => 3,
    }
}

const fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        i += 1;
    }
    hash
}

/// Serializes slices of one volume. Shared read-only across worker threads.
pub struct SliceEncoder<'a> {
    metadata: &'a PatientMetadata,
    geometry: &'a VolumeGeometry,
    format: OutputFormat,
    bit_depth: BitDepth,
    uids: SeriesUids,
}

impl<'a> SliceEncoder<'a> {
    pub fn new(
        metadata: &'a PatientMetadata,
        geometry: &'a VolumeGeometry,
        format: OutputFormat,
        bit_depth: BitDepth,
        uids: SeriesUids,
    ) -> Self {
        Self {
            metadata,
            geometry,
            format,
            bit_depth,
            uids,
        }
    }

    pub fn uids(&self) -> &SeriesUids {
        &self.uids
    }

    /// Encode one slice.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::SliceEncodingFailure`] naming the slice.
    pub fn encode(&self, slice: &SliceDescriptor) -> Result<Vec<u8>> {
        let encoded = match self.format {
            OutputFormat::Dicom => self.encode_dicom(slice),
            OutputFormat::Png => self.encode_png(slice),
        };
        encoded.map_err(|reason| ConversionError::SliceEncodingFailure {
            index: slice.index,
            reason,
        })
    }

    fn encode_png(&self, slice: &SliceDescriptor) -> Result<Vec<u8>, String> {
        let samples = slice.rescaled(self.geometry.value_range, self.bit_depth);
        let (width, height) = (slice.columns as u32, slice.rows as u32);
        let mut out = Cursor::new(Vec::new());

        let written = match self.bit_depth {
            BitDepth::Eight => {
                let pixels = samples.into_iter().map(|v| v as u8).collect();
                ImageBuffer::<Luma<u8>, Vec<u8>>::from_raw(width, height, pixels)
                    .ok_or("pixel buffer does not match slice shape")?
                    .write_to(&mut out, ImageFormat::Png)
            }
            BitDepth::Sixteen => ImageBuffer::<Luma<u16>, Vec<u16>>::from_raw(width, height, samples)
                .ok_or("pixel buffer does not match slice shape")?
                .write_to(&mut out, ImageFormat::Png),
        };
        written.map_err(|err| err.to_string())?;

        Ok(out.into_inner())
    }

    fn encode_dicom(&self, slice: &SliceDescriptor) -> Result<Vec<u8>, String> {
        let rows = u16::try_from(slice.rows)
            .map_err(|_| format!("{} rows exceed the DICOM limit", slice.rows))?;
        let columns = u16::try_from(slice.columns)
            .map_err(|_| format!("{} columns exceed the DICOM limit", slice.columns))?;
        if slice.pixels.len() != slice.rows * slice.columns {
            return Err("pixel buffer does not match slice shape".to_owned());
        }

        let sop_instance_uid = self.uids.sop_instance(slice);
        let mut obj = InMemDicomObject::new_empty();
        let mut put_str = |tag, vr, value: &str| {
            obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
        };

        put_str(tags::SOP_CLASS_UID, VR::UI, uids::CT_IMAGE_STORAGE);
        put_str(tags::SOP_INSTANCE_UID, VR::UI, &sop_instance_uid);
        put_str(tags::STUDY_INSTANCE_UID, VR::UI, &self.uids.study);
        put_str(tags::SERIES_INSTANCE_UID, VR::UI, &self.uids.series);
        put_str(tags::FRAME_OF_REFERENCE_UID, VR::UI, &self.uids.frame_of_reference);

        let metadata = self.metadata;
        put_str(tags::PATIENT_NAME, VR::PN, &metadata.dicom_person_name());
        put_str(tags::PATIENT_ID, VR::LO, &metadata.patient_id);
        put_str(
            tags::PATIENT_BIRTH_DATE,
            VR::DA,
            dicom_date(&metadata.birth_date).unwrap_or_default(),
        );
        put_str(tags::PATIENT_SEX, VR::CS, dicom_sex(&metadata.sex));
        put_str(
            tags::STUDY_DATE,
            VR::DA,
            dicom_date(&metadata.photo_date).unwrap_or_default(),
        );
        put_str(
            tags::STUDY_TIME,
            VR::TM,
            dicom_time(&metadata.photo_date).unwrap_or_default(),
        );
        put_str(tags::STUDY_ID, VR::SH, truncate(&metadata.scan_task_id, 16));
        put_str(tags::ACCESSION_NUMBER, VR::SH, "");
        put_str(tags::REFERRING_PHYSICIAN_NAME, VR::PN, "");
        put_str(tags::MODALITY, VR::CS, MODALITY);
        put_str(tags::IMAGE_TYPE, VR::CS, IMAGE_TYPE);
        put_str(tags::IMAGE_COMMENTS, VR::LT, &metadata.comment);
        put_str(
            tags::SERIES_DESCRIPTION,
            VR::LO,
            &format!("{} reconstruction", slice.orientation.as_str()),
        );

        let (row_spacing, column_spacing) = slice.pixel_spacing;
        put_str(
            tags::PIXEL_SPACING,
            VR::DS,
            &format!("{}\\{}", ds(row_spacing.into()), ds(column_spacing.into())),
        );
        put_str(tags::SLICE_THICKNESS, VR::DS, &ds(slice.thickness.into()));
        put_str(tags::SLICE_LOCATION, VR::DS, &ds(slice.slice_location.into()));
        put_str(
            tags::IMAGE_POSITION_PATIENT,
            VR::DS,
            &image_position(slice.orientation, slice.slice_location),
        );
        put_str(
            tags::IMAGE_ORIENTATION_PATIENT,
            VR::DS,
            image_orientation(slice.orientation),
        );
        put_str(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, "MONOCHROME2");
        put_str(tags::SERIES_NUMBER, VR::IS, &series_number(slice.orientation).to_string());
        put_str(tags::INSTANCE_NUMBER, VR::IS, &slice.instance_number.to_string());

        let (min, max) = self.geometry.value_range;
        let slope = f64::from(max.saturating_sub(min)) / f64::from(self.bit_depth.max_value());
        put_str(tags::RESCALE_INTERCEPT, VR::DS, &ds(f64::from(min)));
        put_str(tags::RESCALE_SLOPE, VR::DS, &ds(slope));
        put_str(tags::RESCALE_TYPE, VR::LO, "US");

        let bits = self.bit_depth.bits();
        let mut put_u16 = |tag, value: u16| {
            obj.put(DataElement::new(tag, VR::US, PrimitiveValue::from(value)));
        };
        put_u16(tags::SAMPLES_PER_PIXEL, 1);
        put_u16(tags::ROWS, rows);
        put_u16(tags::COLUMNS, columns);
        put_u16(tags::BITS_ALLOCATED, bits);
        put_u16(tags::BITS_STORED, bits);
        put_u16(tags::HIGH_BIT, bits - 1);
        put_u16(tags::PIXEL_REPRESENTATION, 0);

        let samples = slice.rescaled(self.geometry.value_range, self.bit_depth);
        let pixel_data = match self.bit_depth {
            BitDepth::Eight => DataElement::new(
                tags::PIXEL_DATA,
                VR::OB,
                PrimitiveValue::from(samples.into_iter().map(|v| v as u8).collect::<Vec<u8>>()),
            ),
            BitDepth::Sixteen => {
                DataElement::new(tags::PIXEL_DATA, VR::OW, PrimitiveValue::U16(samples.into()))
            }
        };
        obj.put(pixel_data);

        let file = obj
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                    .media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
                    .media_storage_sop_instance_uid(sop_instance_uid),
            )
            .map_err(|err| err.to_string())?;

        let mut out = Vec::new();
        file.write_all(&mut out).map_err(|err| err.to_string())?;
        Ok(out)
    }
}

/// `YYYYMMDD` prefix of a scanner timestamp.
fn dicom_date(value: &str) -> Option<&str> {
    let date = value.get(..8)?;
    date.bytes().all(|b| b.is_ascii_digit()).then_some(date)
}

/// `HHMMSS` following the date in a `YYYYMMDDHHMMSS` timestamp.
fn dicom_time(value: &str) -> Option<&str> {
    dicom_date(value)?;
    let time = value.get(8..14)?;
    time.bytes().all(|b| b.is_ascii_digit()).then_some(time)
}

fn dicom_sex(value: &str) -> &'static str {
    match value.trim().to_lowercase().as_str() {
        "" => "",
        "m" | "male" | "м" | "муж" | "мужской" => "M",
        "f" | "female" | "ж" | "жен" | "женский" => "F",
        _ => "O",
    }
}

fn truncate(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((end, _)) => &value[..end],
        None => value,
    }
}

/// Decimal string, at most 16 characters.
fn ds(value: f64) -> String {
    let formatted = format!("{value:.6}");
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    match trimmed {
        "" | "-0" => "0".to_owned(),
        _ => truncate(trimmed, 16).to_owned(),
    }
}

fn image_position(orientation: Orientation, location: f32) -> String {
    let location = ds(location.into());
    match orientation {
        Orientation::Axial => format!("0\\0\\{location}"),
        Orientation::Coronal => format!("0\\{location}\\0"),
        Orientation::Sagittal => format!("{location}\\0\\0"),
    }
}

/// Row and column direction cosines; rows of coronal and sagittal slices
/// run along +z, matching axial slice positions.
fn image_orientation(orientation: Orientation) -> &'static str {
    match orientation {
        Orientation::Axial => "1\\0\\0\\0\\1\\0",
        Orientation::Coronal => "1\\0\\0\\0\\0\\1",
        Orientation::Sagittal => "0\\1\\0\\0\\0\\1",
    }
}

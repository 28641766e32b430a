//! Sidecar metadata parsing.
//!
//! OneVolumeViewer exports describe the patient and the scan in two loosely
//! structured files: `ver_ctrl.txt`, a key/value list whose delimiters and
//! quoting vary between scanner software versions, and `VolumeId.xml`, which
//! declares the reconstructed volume radius and voxel size. Neither is
//! trusted to be well formed: unparsable lines are recorded as
//! [`Diagnostic`]s and skipped, never raised as errors.

use std::sync::OnceLock;

use encoding_rs::{Encoding, UTF_16LE, WINDOWS_1251};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use regex::Regex;
use serde::Serialize;

use crate::geometry::{GeometryHint, HINT_RANGE};

/// Shortest key accepted left of a separator.
const MIN_KEY_LEN: usize = 1;

/// Separators in the order they are tried.
const SEPARATORS: [char; 4] = ['=', ':', '\t', ' '];

const COMMENT_MARKERS: [char; 2] = ['\'', '#'];

/// Whether a value was written by the scanner software or inferred from
/// other fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    #[default]
    Declared,
    Derived,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Sourced<T> {
    pub value: T,
    pub origin: Origin,
}

impl<T> Sourced<T> {
    pub fn declared(value: T) -> Self {
        Self {
            value,
            origin: Origin::Declared,
        }
    }

    pub fn derived(value: T) -> Self {
        Self {
            value,
            origin: Origin::Derived,
        }
    }
}

/// Acquisition and reconstruction parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeParameters {
    /// Reconstruction radius in voxels (`VOLUME_RADIUS:` in the comment).
    pub volume_radius: Option<Sourced<f32>>,
    /// Detector pixel pitch (`PIXEL:<n>um` in the comment), in millimeters.
    pub pixel_pitch_mm: Option<Sourced<f32>>,
    pub magnification: Option<Sourced<f32>>,
    pub kv: Option<Sourced<f32>>,
    pub ma: Option<Sourced<f32>>,
    pub slice_interval_mm: Option<Sourced<f32>>,
    pub slice_thickness_mm: Option<Sourced<f32>>,
    /// `dmmVolumeRadius` from VolumeId.xml.
    pub volume_radius_mm: Option<Sourced<f32>>,
    /// `dmmVoxelSize` from VolumeId.xml.
    pub voxel_size_mm: Option<Sourced<f32>>,
    pub volume_center_mm: Option<Sourced<[f32; 3]>>,
    pub reconstruction_filter: Option<Sourced<String>>,
}

impl VolumeParameters {
    fn merge(&mut self, other: VolumeParameters) {
        fill(&mut self.volume_radius, other.volume_radius);
        fill(&mut self.pixel_pitch_mm, other.pixel_pitch_mm);
        fill(&mut self.magnification, other.magnification);
        fill(&mut self.kv, other.kv);
        fill(&mut self.ma, other.ma);
        fill(&mut self.slice_interval_mm, other.slice_interval_mm);
        fill(&mut self.slice_thickness_mm, other.slice_thickness_mm);
        fill(&mut self.volume_radius_mm, other.volume_radius_mm);
        fill(&mut self.voxel_size_mm, other.voxel_size_mm);
        fill(&mut self.volume_center_mm, other.volume_center_mm);
        fill(&mut self.reconstruction_filter, other.reconstruction_filter);
    }
}

fn fill<T>(slot: &mut Option<T>, other: Option<T>) {
    if slot.is_none() {
        *slot = other;
    }
}

/// Normalized patient record. Text fields are empty when no sidecar
/// declared them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientMetadata {
    pub version: String,
    pub patient_id: String,
    pub patient_name: String,
    pub family_name: Sourced<String>,
    pub given_name: Sourced<String>,
    pub middle_name: Sourced<String>,
    pub birth_date: String,
    pub sex: String,
    pub photo_date: String,
    pub scan_task_id: String,
    pub comment: String,
    pub parameters: VolumeParameters,
}

impl PatientMetadata {
    /// Fill every empty field of `self` from `other`.
    ///
    /// Fields already set are kept, so merging sidecars that declare
    /// disjoint fields gives the same record in either order.
    pub fn merge(&mut self, other: PatientMetadata) {
        fill_text(&mut self.version, other.version);
        fill_text(&mut self.patient_id, other.patient_id);
        fill_text(&mut self.patient_name, other.patient_name);
        fill_sourced_text(&mut self.family_name, other.family_name);
        fill_sourced_text(&mut self.given_name, other.given_name);
        fill_sourced_text(&mut self.middle_name, other.middle_name);
        fill_text(&mut self.birth_date, other.birth_date);
        fill_text(&mut self.sex, other.sex);
        fill_text(&mut self.photo_date, other.photo_date);
        fill_text(&mut self.scan_task_id, other.scan_task_id);
        fill_text(&mut self.comment, other.comment);
        self.parameters.merge(other.parameters);
    }

    /// Geometry hints for the volume decoder.
    ///
    /// The cross-section comes from the comment's voxel radius, or from the
    /// XML radius divided by the voxel size. Spacing prefers the declared
    /// voxel size over the derived pixel pitch.
    pub fn geometry_hint(&self) -> GeometryHint {
        let params = &self.parameters;
        let from_voxel_radius = params
            .volume_radius
            .as_ref()
            .and_then(|r| diameter_in_voxels(2.0 * r.value));
        let from_millimeters = match (&params.volume_radius_mm, &params.voxel_size_mm) {
            (Some(radius), Some(voxel)) if voxel.value > 0.0 => {
                diameter_in_voxels(2.0 * radius.value / voxel.value)
            }
            _ => None,
        };

        let spacing_mm = params
            .voxel_size_mm
            .as_ref()
            .or(params.pixel_pitch_mm.as_ref())
            .map(|s| s.value)
            .filter(|s| s.is_finite() && *s > 0.0);

        GeometryHint {
            cross_section: from_voxel_radius.or(from_millimeters),
            spacing_mm,
        }
    }

    /// Patient name in DICOM PN form (`family^given^middle`).
    pub fn dicom_person_name(&self) -> String {
        let parts = [
            self.family_name.value.as_str(),
            self.given_name.value.as_str(),
            self.middle_name.value.as_str(),
        ];
        if parts.iter().all(|p| p.is_empty()) {
            return self.patient_name.clone();
        }
        parts.join("^").trim_end_matches('^').to_owned()
    }

    fn set(&mut self, field: Field, value: String) {
        let slot = match field {
            Field::Version => &mut self.version,
            Field::PatientId => &mut self.patient_id,
            Field::PatientName => &mut self.patient_name,
            Field::FamilyName => &mut self.family_name.value,
            Field::GivenName => &mut self.given_name.value,
            Field::MiddleName => &mut self.middle_name.value,
            Field::BirthDate => &mut self.birth_date,
            Field::Sex => &mut self.sex,
            Field::PhotoDate => &mut self.photo_date,
            Field::ScanTaskId => &mut self.scan_task_id,
            Field::Comment => &mut self.comment,
        };
        if slot.is_empty() {
            *slot = value;
        }
    }

    fn derive_name_parts(&mut self) {
        let declared = [&self.family_name, &self.given_name, &self.middle_name]
            .iter()
            .any(|p| !p.value.is_empty());
        if declared || self.patient_name.is_empty() {
            return;
        }
        if let Some((family, given, middle)) = split_person_name(&self.patient_name) {
            self.family_name = Sourced::derived(family);
            self.given_name = Sourced::derived(given);
            self.middle_name = Sourced::derived(middle);
        }
    }
}

fn fill_text(slot: &mut String, other: String) {
    if slot.is_empty() {
        *slot = other;
    }
}

fn fill_sourced_text(slot: &mut Sourced<String>, other: Sourced<String>) {
    if slot.value.is_empty() {
        *slot = other;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// No separator with a usable key on the line.
    MissingSeparator,
    /// A separator was found but the key left of it was empty.
    EmptyKey,
    UnknownKey(String),
    MalformedXml(String),
}

/// A non-fatal problem found while parsing a sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    /// 1-based line number.
    pub line: usize,
    pub kind: DiagnosticKind,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedMetadata {
    pub metadata: PatientMetadata,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Version,
    PatientId,
    PatientName,
    FamilyName,
    GivenName,
    MiddleName,
    BirthDate,
    Sex,
    PhotoDate,
    ScanTaskId,
    Comment,
}

/// Normalized key → canonical field.
const ALIASES: &[(&str, Field)] = &[
    ("ver", Field::Version),
    ("version", Field::Version),
    ("patientid", Field::PatientId),
    ("id", Field::PatientId),
    ("pid", Field::PatientId),
    ("patientname", Field::PatientName),
    ("name", Field::PatientName),
    ("fullname", Field::PatientName),
    ("familyname", Field::FamilyName),
    ("lastname", Field::FamilyName),
    ("surname", Field::FamilyName),
    ("givenname", Field::GivenName),
    ("firstname", Field::GivenName),
    ("middlename", Field::MiddleName),
    ("patronymic", Field::MiddleName),
    ("birthday", Field::BirthDate),
    ("birthdate", Field::BirthDate),
    ("dob", Field::BirthDate),
    ("sex", Field::Sex),
    ("gender", Field::Sex),
    ("photodate", Field::PhotoDate),
    ("studydate", Field::PhotoDate),
    ("date", Field::PhotoDate),
    ("cttaskid", Field::ScanTaskId),
    ("taskid", Field::ScanTaskId),
    ("scantaskid", Field::ScanTaskId),
    ("comment", Field::Comment),
    ("comments", Field::Comment),
    ("attendant", Field::Comment),
];

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

fn lookup_field(key: &str) -> Option<Field> {
    let normalized = normalize_key(key);
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == normalized)
        .map(|(_, field)| *field)
}

/// Parse one key/value sidecar (typically `ver_ctrl.txt`).
pub fn parse(text: &str) -> ParsedMetadata {
    let mut metadata = PatientMetadata::default();
    let mut diagnostics = Vec::new();

    for (number, raw) in text.lines().enumerate() {
        let line = raw.trim().trim_start_matches('\u{feff}');
        if line.is_empty()
            || line.starts_with(COMMENT_MARKERS)
            || (line.starts_with('[') && line.ends_with(']'))
        {
            continue;
        }

        let (key, value) = match split_key_value(line) {
            Ok(pair) => pair,
            Err(kind) => {
                diagnostics.push(Diagnostic {
                    line: number + 1,
                    kind,
                });
                continue;
            }
        };

        let Some(field) = lookup_field(key) else {
            diagnostics.push(Diagnostic {
                line: number + 1,
                kind: DiagnosticKind::UnknownKey(key.to_owned()),
            });
            continue;
        };

        let value = unquote(value);
        if !value.is_empty() {
            metadata.set(field, value.to_owned());
        }
    }

    metadata.parameters.merge(extract_comment_parameters(&metadata.comment));
    metadata.derive_name_parts();

    if !diagnostics.is_empty() {
        log::debug!("Sidecar parsed with {} diagnostics", diagnostics.len());
    }
    ParsedMetadata {
        metadata,
        diagnostics,
    }
}

fn split_key_value(line: &str) -> Result<(&str, &str), DiagnosticKind> {
    let mut saw_empty_key = false;
    for separator in SEPARATORS {
        let Some(position) = line.find(separator) else {
            continue;
        };
        let key = line[..position].trim();
        if key.len() < MIN_KEY_LEN {
            saw_empty_key = true;
            continue;
        }
        if key.contains(['"', '\'']) {
            continue;
        }
        return Ok((key, &line[position + separator.len_utf8()..]));
    }
    Err(if saw_empty_key {
        DiagnosticKind::EmptyKey
    } else {
        DiagnosticKind::MissingSeparator
    })
}

/// Round a diameter to whole voxels, dropping values no scanner produces.
fn diameter_in_voxels(diameter: f32) -> Option<usize> {
    let rounded = diameter.round();
    if rounded.is_finite() && rounded >= 1.0 && rounded <= *HINT_RANGE.end() as f32 {
        let size = rounded as usize;
        if HINT_RANGE.contains(&size) {
            return Some(size);
        }
    }
    log::warn!("Ignoring implausible volume diameter of {diameter} voxels");
    None
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return value[1..value.len() - 1].trim();
        }
    }
    value.trim_matches(|c| c == '"' || c == '\'').trim()
}

#[derive(Debug, Clone, Copy)]
enum CommentParam {
    VolumeRadius,
    PixelPitch,
    Magnification,
    Kv,
    Ma,
    SliceInterval,
    SliceThickness,
}

const COMMENT_PATTERNS: [(CommentParam, &str); 7] = [
    (CommentParam::VolumeRadius, r"(?i)\bVOLUME_RADIUS:\s*([0-9]+(?:\.[0-9]*)?)"),
    (CommentParam::PixelPitch, r"(?i)\bPIXEL:\s*([0-9]+(?:\.[0-9]*)?)\s*um"),
    (CommentParam::Magnification, r"(?i)\bMAG:\s*([0-9]+(?:\.[0-9]*)?)"),
    (CommentParam::Kv, r"\bkV:\s*([0-9]+(?:\.[0-9]*)?)"),
    (CommentParam::Ma, r"\bmA:\s*([0-9]+(?:\.[0-9]*)?)"),
    (CommentParam::SliceInterval, r"\bSliceInterval:\s*([0-9]+(?:\.[0-9]*)?)\s*mm"),
    (CommentParam::SliceThickness, r"\bSliceThickness:\s*([0-9]+(?:\.[0-9]*)?)\s*mm"),
];

static COMMENT_REGEXES: OnceLock<Vec<(CommentParam, Regex)>> = OnceLock::new();

fn comment_regexes() -> &'static [(CommentParam, Regex)] {
    COMMENT_REGEXES.get_or_init(|| {
        COMMENT_PATTERNS
            .iter()
            .map(|(param, pattern)| {
                (
                    *param,
                    Regex::new(pattern).expect("Invalid comment parameter pattern"),
                )
            })
            .collect()
    })
}

/// Pull engineering parameters out of the free-text comment field.
pub fn extract_comment_parameters(comment: &str) -> VolumeParameters {
    let mut params = VolumeParameters::default();
    if comment.is_empty() {
        return params;
    }

    for (param, regex) in comment_regexes() {
        let Some(value) = regex
            .captures(comment)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<f32>().ok())
        else {
            continue;
        };
        let value = Sourced::derived(value);
        match param {
            CommentParam::VolumeRadius => params.volume_radius = Some(value),
            CommentParam::PixelPitch => {
                params.pixel_pitch_mm = Some(Sourced::derived(value.value / 1000.0))
            }
            CommentParam::Magnification => params.magnification = Some(value),
            CommentParam::Kv => params.kv = Some(value),
            CommentParam::Ma => params.ma = Some(value),
            CommentParam::SliceInterval => params.slice_interval_mm = Some(value),
            CommentParam::SliceThickness => params.slice_thickness_mm = Some(value),
        }
    }
    params
}

/// Split a free-form patient name into `(family, given, middle)`.
///
/// `^`-separated names follow DICOM PN order. Whitespace-separated names are
/// read as `given [middle] family`, unless the last token carries a
/// patronymic suffix, in which case the name is `family given patronymic`.
fn split_person_name(name: &str) -> Option<(String, String, String)> {
    if name.contains('^') {
        let mut parts = name.split('^').map(|p| p.trim().to_owned());
        let family = parts.next().unwrap_or_default();
        let given = parts.next().unwrap_or_default();
        let middle = parts.next().unwrap_or_default();
        return Some((family, given, middle));
    }

    let tokens: Vec<&str> = name.split_whitespace().collect();
    match tokens.as_slice() {
        [given, family] => Some(((*family).to_owned(), (*given).to_owned(), String::new())),
        [first, second, last] if is_patronymic(last) => Some((
            (*first).to_owned(),
            (*second).to_owned(),
            (*last).to_owned(),
        )),
        [given, middle, family] => Some((
            (*family).to_owned(),
            (*given).to_owned(),
            (*middle).to_owned(),
        )),
        _ => None,
    }
}

fn is_patronymic(token: &str) -> bool {
    let lower = token.to_lowercase();
    ["ovna", "evna", "ovich", "evich", "ichna", "вна", "вич", "чна"]
        .iter()
        .any(|suffix| lower.ends_with(suffix))
}

/// Parse `VolumeId.xml`.
///
/// Only the first occurrence of each element counts, which is the `V0`
/// volume in every export seen so far.
pub fn parse_volume_xml(text: &str) -> ParsedMetadata {
    let mut params = VolumeParameters::default();
    let mut diagnostics = Vec::new();
    let mut reader = Reader::from_str(text);

    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) | Ok(Event::Empty(element)) => {
                read_volume_element(&element, &mut params);
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                let position = (reader.buffer_position() as usize).min(text.len());
                let line = text.as_bytes()[..position]
                    .iter()
                    .filter(|b| **b == b'\n')
                    .count()
                    + 1;
                log::warn!("VolumeId.xml is malformed at line {line}: {err}");
                diagnostics.push(Diagnostic {
                    line,
                    kind: DiagnosticKind::MalformedXml(err.to_string()),
                });
                break;
            }
            _ => {}
        }
    }

    ParsedMetadata {
        metadata: PatientMetadata {
            parameters: params,
            ..Default::default()
        },
        diagnostics,
    }
}

fn read_volume_element(element: &BytesStart<'_>, params: &mut VolumeParameters) {
    let attribute = |wanted: &str| -> Option<String> {
        element
            .attributes()
            .filter_map(Result::ok)
            .find(|attr| attr.key.local_name().as_ref() == wanted.as_bytes())
            .and_then(|attr| attr.unescape_value().ok())
            .map(|value| value.trim().to_owned())
    };
    let number = |wanted: &str| attribute(wanted).and_then(|v| v.parse::<f32>().ok());

    match element.local_name().as_ref() {
        b"dmmVolumeRadius" => {
            fill(&mut params.volume_radius_mm, number("value").map(Sourced::declared))
        }
        b"dmmVoxelSize" => fill(&mut params.voxel_size_mm, number("value").map(Sourced::declared)),
        b"dmmVolumeCenter" => {
            if let (Some(x), Some(y), Some(z)) = (number("X"), number("Y"), number("Z")) {
                fill(&mut params.volume_center_mm, Some(Sourced::declared([x, y, z])));
            }
        }
        b"strReconstructionFilterSetName" => fill(
            &mut params.reconstruction_filter,
            attribute("value")
                .filter(|v| !v.is_empty())
                .map(Sourced::declared),
        ),
        _ => {}
    }
}

/// Decode sidecar bytes to text.
///
/// BOM-marked UTF-8/UTF-16 is honoured; BOM-less UTF-16LE is recognised by
/// its zero high bytes; anything else that is not valid UTF-8 is read as
/// Windows-1251, the code page of the scanner software's Cyrillic builds.
pub fn decode_text(bytes: &[u8]) -> String {
    if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
        let (text, _) = encoding.decode_without_bom_handling(&bytes[bom_len..]);
        return text.into_owned();
    }
    if looks_like_utf16le(bytes) {
        let (text, _) = UTF_16LE.decode_without_bom_handling(bytes);
        return text.into_owned();
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_owned(),
        Err(_) => {
            let (text, _) = WINDOWS_1251.decode_without_bom_handling(bytes);
            text.into_owned()
        }
    }
}

fn looks_like_utf16le(bytes: &[u8]) -> bool {
    let pairs = bytes.len() / 2;
    if pairs < 2 {
        return false;
    }
    let zero_high = bytes
        .chunks_exact(2)
        .filter(|pair| pair[1] == 0 && pair[0] != 0)
        .count();
    zero_high * 10 >= pairs * 9
}

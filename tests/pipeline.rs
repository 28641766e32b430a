use ovv_volume::{
    BitDepth, ContentKind, ConversionError, ConversionOptions, Converter, Orientation,
    OutputFormat, create_archive, inspect,
};
use pretty_assertions::assert_eq;

const VER_CTRL: &str = r#"Ver="2.1"
PatientID="000123"
PatientName="Anel Aiyanovna Ibragimova"
BirthDay="19900101"
Sex="F"
CTTaskID="5512"
PhotoDate="20250718102232"
Comment="VOLUME_RADIUS:128 PIXEL:125.0um MAG:1.5 kV:90 mA:8"
"#;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Little-endian 16-bit cube whose samples cycle through `0..modulus`.
fn cube(side: usize, modulus: usize) -> Vec<u8> {
    (0..side * side * side)
        .flat_map(|i| ((i % modulus) as u16).to_le_bytes())
        .collect()
}

#[test]
fn scanner_export_converts_to_dicom_series() {
    init_logger();
    let container = create_archive(&[
        ("CT_20250718/CT_0.vol", cube(256, 4096)),
        ("CT_20250718/ver_ctrl.txt", VER_CTRL.as_bytes().to_vec()),
        ("OneVolumeViewer.exe", b"MZ\x90\x00\x03".to_vec()),
    ])
    .unwrap();

    let conversion = Converter::default().convert_archive(&container).unwrap();

    assert_eq!(conversion.grid.dim(), (256, 256, 256));
    assert_eq!(conversion.grid.spacing(), (0.125, 0.125, 0.125));
    assert_eq!(conversion.grid.value_range(), (0, 4095));
    assert_eq!(conversion.metadata.patient_id, "000123");
    assert_eq!(conversion.metadata.dicom_person_name(), "Ibragimova^Anel^Aiyanovna");
    assert_eq!(conversion.diagnostics, vec![]);

    let output = inspect(&conversion.archive).unwrap();
    let files = output.files();
    assert_eq!(files.len(), 257);
    assert_eq!(files[0].name, "slice_001.dcm");
    assert_eq!(files[0].kind, ContentKind::Dicom);
    assert_eq!(files[255].name, "slice_256.dcm");
    assert_eq!(files[256].name, "manifest.json");

    let manifest: serde_json::Value =
        serde_json::from_slice(&output.read(&files[256]).unwrap()).unwrap();
    assert_eq!(manifest["sliceCount"], 256);
    assert_eq!(manifest["sampleWidth"], 2);
    assert_eq!(manifest["headerOffset"], 0);
    assert_eq!(manifest["spacing"], serde_json::json!([0.125, 0.125, 0.125]));
    assert_eq!(manifest["patient"]["patientId"], "000123");
}

#[test]
fn bare_volume_with_sidecar_converts() {
    init_logger();
    let options = ConversionOptions::default()
        .with_orientation(Orientation::Coronal)
        .with_format(OutputFormat::Png);

    let conversion = Converter::new(options)
        .convert_volume(&cube(128, 1000), &[("ver_ctrl.txt", &b"PatientID=\"42\"\nbogus line"[..])])
        .unwrap();

    assert_eq!(conversion.grid.dim(), (128, 128, 128));
    assert_eq!(conversion.metadata.patient_id, "42");
    assert_eq!(conversion.diagnostics.len(), 1);
    assert_eq!(conversion.diagnostics[0].file, "ver_ctrl.txt");
    assert_eq!(conversion.diagnostics[0].diagnostic.line, 2);

    let output = inspect(&conversion.archive).unwrap();
    assert_eq!(output.files().len(), 129);
    assert_eq!(output.files()[127].name, "slice_128.png");
}

#[test]
fn converted_series_reimports_losslessly() {
    init_logger();
    let options = ConversionOptions::default().with_bit_depth(BitDepth::Sixteen);
    let converter = Converter::new(options);

    // Samples span the full 16-bit range, so rescaling is the identity.
    let first = converter.convert_volume(&cube(128, 65536), &[]).unwrap();
    let second = converter.convert_archive(&first.archive).unwrap();

    assert_eq!(second.grid.dim(), (128, 128, 128));
    assert_eq!(second.grid.spacing(), (1.0, 1.0, 1.0));
    assert_eq!(second.grid.data(), first.grid.data());
}

#[test]
fn sequential_and_parallel_runs_agree() {
    let volume = cube(128, 777);
    let options = ConversionOptions::default().with_format(OutputFormat::Png);

    let parallel = Converter::new(options.clone())
        .convert_volume(&volume, &[])
        .unwrap();
    let sequential = Converter::new(options.with_parallel(false))
        .convert_volume(&volume, &[])
        .unwrap();

    assert_eq!(parallel.archive, sequential.archive);
}

#[test]
fn executables_only_archive_has_no_volume() {
    let container = create_archive(&[
        ("OneVolumeViewer.exe", b"MZ\x90\x00".to_vec()),
        ("lib/viewer.so", b"\x7fELF\x02\x01".to_vec()),
    ])
    .unwrap();

    let err = Converter::default().convert_archive(&container).unwrap_err();

    assert!(matches!(err, ConversionError::NoVolumeDataFound));
    assert!(err.is_source_problem());
}

#[test]
fn corrupt_container_is_not_a_source_problem() {
    let err = Converter::default()
        .convert_archive(b"PK\x03\x04 truncated")
        .unwrap_err();

    assert!(matches!(err, ConversionError::ArchiveCorrupt(_)));
    assert!(!err.is_source_problem());
}

#[test]
fn unexplainable_volume_fails_explicitly() {
    let err = Converter::default()
        .convert_volume(&[7u8; 1000], &[])
        .unwrap_err();

    assert!(matches!(
        err,
        ConversionError::UnresolvableGeometry { total_bytes: 1000 }
    ));
}

#[test]
fn analysis_reports_stats_without_slicing() {
    let volume: Vec<u8> = (0..64 * 64 * 100)
        .flat_map(|i| ((i % 100) as u16).to_le_bytes())
        .collect();
    let sidecar = &br#"Comment="PIXEL:200um""#[..];

    let analysis = Converter::default()
        .analyze_volume(&volume, &[("ver_ctrl.txt", sidecar)])
        .unwrap();

    assert_eq!(analysis.stats.dimensions, "64×64×100");
    assert_eq!(analysis.stats.total_voxels, 64 * 64 * 100);
    // one zero per cycle of 100 samples
    assert_eq!(analysis.stats.non_zero_voxels, 64 * 64 * 100 / 100 * 99);
    assert_eq!(analysis.stats.data_size_bytes, volume.len());
    assert_eq!(analysis.geometry.spacing, (0.2, 0.2, 0.2));
    assert_eq!(analysis.metadata.comment, "PIXEL:200um");

    let grid = Converter::default()
        .convert_volume(&volume, &[("ver_ctrl.txt", sidecar)])
        .unwrap()
        .grid;
    assert_eq!(grid.to_raw_bytes(), volume);
}

#[test]
fn unreadable_dicom_series_is_a_source_problem() {
    let container = create_archive(&[
        ("series/IM0001.dcm", b"not really dicom".to_vec()),
        ("series/IM0002.dcm", b"neither is this".to_vec()),
    ])
    .unwrap();

    let err = Converter::default().convert_archive(&container).unwrap_err();

    assert!(matches!(err, ConversionError::DicomSeries(_)));
    assert!(err.is_source_problem());
}

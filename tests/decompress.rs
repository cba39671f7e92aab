use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use flashkit::decompress::{decompress_file, DecompressError};
use flashkit::images::CompressionKind;
use flashkit::utils::CancelToken;

fn raw_image() -> Vec<u8> {
    (0..300_000u32).map(|i| (i % 7 + i / 1000) as u8).collect()
}

fn xz(data: &[u8]) -> Vec<u8> {
    let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn bzip2(data: &[u8]) -> Vec<u8> {
    let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn zstd(data: &[u8]) -> Vec<u8> {
    zstd::encode_all(data, 3).unwrap()
}

/// Archive with a readme ahead of the image member
fn zip(data: &[u8]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    writer.start_file("README.txt", options).unwrap();
    writer.write_all(b"not the image").unwrap();
    writer.start_file("os.img", options).unwrap();
    writer.write_all(data).unwrap();
    writer.finish().unwrap().into_inner()
}

fn write(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_every_format_detected_and_decoded() {
    let dir = tempfile::tempdir().unwrap();
    let raw = raw_image();
    let cases: [(&str, Vec<u8>, CompressionKind); 5] = [
        ("os.img.xz", xz(&raw), CompressionKind::Xz),
        ("os.img.gz", gzip(&raw), CompressionKind::Gzip),
        ("os.img.bz2", bzip2(&raw), CompressionKind::Bzip2),
        ("os.img.zst", zstd(&raw), CompressionKind::Zstd),
        ("os.zip", zip(&raw), CompressionKind::Zip),
    ];

    for (name, compressed, kind) in cases {
        let input = write(dir.path(), name, &compressed);
        assert_eq!(CompressionKind::detect(&input).unwrap(), kind, "{}", name);

        let output = dir.path().join(format!("{}.out", name));
        let mut last = None;
        let written =
            decompress_file(&input, &output, kind, &CancelToken::new(), |p| last = Some(p))
                .unwrap();

        assert_eq!(written, raw.len() as u64, "{}", name);
        assert_eq!(std::fs::read(&output).unwrap(), raw, "{}", name);
        let last = last.expect("progress reported");
        assert_eq!(last.bytes_written, raw.len() as u64, "{}", name);
    }
}

#[test]
fn test_unknown_extension_falls_back_to_magic() {
    let dir = tempfile::tempdir().unwrap();
    let input = write(dir.path(), "download.bin", &zstd(&raw_image()));
    assert_eq!(CompressionKind::detect(&input).unwrap(), CompressionKind::Zstd);
}

#[test]
fn test_truncated_xz_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let compressed = xz(&raw_image());
    let input = write(dir.path(), "cut.img.xz", &compressed[..compressed.len() / 2]);
    let output = dir.path().join("cut.img");

    let err = decompress_file(
        &input,
        &output,
        CompressionKind::Xz,
        &CancelToken::new(),
        |_| {},
    )
    .unwrap_err();

    assert!(matches!(err, DecompressError::Corrupt { .. } | DecompressError::Io { .. }));
    assert!(!output.exists());
}

#[test]
fn test_zip_without_image_member_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for name in ["notes.txt", "license.md"] {
        writer
            .start_file(name, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"nothing to flash").unwrap();
    }
    let archive = writer.finish().unwrap().into_inner();
    let input = write(dir.path(), "docs.zip", &archive);
    let output = dir.path().join("docs.img");

    let result = decompress_file(
        &input,
        &output,
        CompressionKind::Zip,
        &CancelToken::new(),
        |_| {},
    );

    assert!(result.is_err());
    assert!(!output.exists());
}

#[test]
fn test_empty_stream_decodes_to_empty_image() {
    let dir = tempfile::tempdir().unwrap();
    let cases: [(&str, Vec<u8>, CompressionKind); 4] = [
        ("empty.img.gz", gzip(&[]), CompressionKind::Gzip),
        ("empty.img.bz2", bzip2(&[]), CompressionKind::Bzip2),
        ("empty.img.zst", zstd(&[]), CompressionKind::Zstd),
        ("empty.zip", zip(&[]), CompressionKind::Zip),
    ];

    for (name, compressed, kind) in cases {
        let input = write(dir.path(), name, &compressed);
        let output = dir.path().join(format!("{}.out", name));
        let written =
            decompress_file(&input, &output, kind, &CancelToken::new(), |_| {}).unwrap();

        assert_eq!(written, 0, "{}", name);
        assert_eq!(std::fs::read(&output).unwrap(), Vec::<u8>::new(), "{}", name);
    }
}

use std::path::PathBuf;

use appvault_core::{
    ArchiveInput, CompressionKind, PrivilegedRunner, StreamStatus, extract_and_decompress,
    package_and_compress,
};
use tempfile::TempDir;

fn tar_available() -> bool {
    std::process::Command::new("tar")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn write_file(path: PathBuf, bytes: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, bytes).unwrap();
}

fn populate_tree(base: &std::path::Path) {
    write_file(base.join("data/alpha.txt"), b"alpha\n");
    write_file(base.join("data/nested/blob.bin"), &[42u8; 10_000]);
    std::fs::create_dir_all(base.join("data/empty")).unwrap();
}

#[tokio::test]
async fn archive_then_extract_reproduces_tree() {
    if !tar_available() {
        eprintln!("tar not available, skipping");
        return;
    }

    for kind in [CompressionKind::Tar, CompressionKind::Zstd] {
        let temp = TempDir::new().unwrap();
        let src_base = temp.path().join("src");
        populate_tree(&src_base);

        let out_dir = temp.path().join("out");
        std::fs::create_dir_all(&out_dir).unwrap();
        let out = out_dir.join(format!("data.{}", kind.suffix()));

        let runner = PrivilegedRunner::direct();
        let result =
            package_and_compress(&runner, kind, &out, &[ArchiveInput::new(&src_base, "data")])
                .await
                .unwrap();
        assert_eq!(
            result.status,
            StreamStatus::Succeeded,
            "archive failed: {}",
            result.info
        );
        assert!(out.is_file());

        let dst = temp.path().join("restored");
        let result = extract_and_decompress(&runner, kind, &out, &dst).await.unwrap();
        assert_eq!(
            result.status,
            StreamStatus::Succeeded,
            "extract failed: {}",
            result.info
        );

        assert_eq!(
            std::fs::read(dst.join("data/alpha.txt")).unwrap(),
            b"alpha\n"
        );
        let blob = std::fs::read(dst.join("data/nested/blob.bin")).unwrap();
        assert_eq!(blob.len(), 10_000);
        assert!(blob.iter().all(|b| *b == 42));
        assert!(dst.join("data/empty").is_dir());
    }
}

#[tokio::test]
async fn zstd_archive_is_smaller_than_plain_tar() {
    if !tar_available() {
        eprintln!("tar not available, skipping");
        return;
    }

    let temp = TempDir::new().unwrap();
    let src_base = temp.path().join("src");
    write_file(src_base.join("data/repetitive.txt"), &[7u8; 200_000]);

    let runner = PrivilegedRunner::direct();
    let plain = temp.path().join("data.tar");
    let packed = temp.path().join("data.tar.zst");

    let result = package_and_compress(
        &runner,
        CompressionKind::Tar,
        &plain,
        &[ArchiveInput::new(&src_base, "data")],
    )
    .await
    .unwrap();
    assert!(result.is_success(), "{}", result.info);

    let result = package_and_compress(
        &runner,
        CompressionKind::Zstd,
        &packed,
        &[ArchiveInput::new(&src_base, "data")],
    )
    .await
    .unwrap();
    assert!(result.is_success(), "{}", result.info);

    let plain_len = std::fs::metadata(&plain).unwrap().len();
    let packed_len = std::fs::metadata(&packed).unwrap().len();
    assert!(packed_len < plain_len, "{packed_len} vs {plain_len}");
}

#[tokio::test]
async fn missing_source_is_a_named_variant_not_an_error() {
    let temp = TempDir::new().unwrap();
    let runner = PrivilegedRunner::direct();

    let result = package_and_compress(
        &runner,
        CompressionKind::Zstd,
        &temp.path().join("out.tar.zst"),
        &[ArchiveInput::new(temp.path().join("nope"), "gone")],
    )
    .await
    .unwrap();
    assert_eq!(result.status, StreamStatus::SourceMissing);
    assert!(!temp.path().join("out.tar.zst").exists());

    let result = extract_and_decompress(
        &runner,
        CompressionKind::Zstd,
        &temp.path().join("missing.tar.zst"),
        &temp.path().join("restored"),
    )
    .await
    .unwrap();
    assert_eq!(result.status, StreamStatus::SourceMissing);
}

#[tokio::test]
async fn failed_output_write_kills_helper_and_removes_output() {
    if !tar_available() {
        eprintln!("tar not available, skipping");
        return;
    }

    let temp = TempDir::new().unwrap();
    let src_base = temp.path().join("src");
    populate_tree(&src_base);

    // The output path is an existing directory, so the stdout consumer cannot
    // create the file and the whole operation must tear down.
    let out = temp.path().join("out.tar.zst");
    std::fs::create_dir_all(&out).unwrap();

    let runner = PrivilegedRunner::direct();
    let result = package_and_compress(
        &runner,
        CompressionKind::Zstd,
        &out,
        &[ArchiveInput::new(&src_base, "data")],
    )
    .await
    .unwrap();

    assert_eq!(result.status, StreamStatus::Failed(-1), "{}", result.info);
    assert!(!out.exists(), "partial output must be removed");
}

#[tokio::test]
async fn corrupt_archive_surfaces_extractor_failure() {
    if !tar_available() {
        eprintln!("tar not available, skipping");
        return;
    }

    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("broken.tar");
    std::fs::write(&archive, b"this is definitely not a tar stream").unwrap();

    let runner = PrivilegedRunner::direct();
    let result = extract_and_decompress(
        &runner,
        CompressionKind::Tar,
        &archive,
        &temp.path().join("restored"),
    )
    .await
    .unwrap();
    assert_ne!(result.status, StreamStatus::Succeeded);
}

//! Tests for the archive fetcher: URL resolution, download, extraction.

mod common;

use common::{mock_config, wordpress_zip, zip_bytes, FALLBACK_PATH, RELEASE_PATH};
use sha2::{Digest, Sha256};
use std::fs;
use tempfile::TempDir;
use wpseed::{extract_archive, find_archive_root, ArchiveFetcher, Config};

fn fetcher_for(server: &mockito::Server) -> (ArchiveFetcher, TempDir) {
    let workspaces = TempDir::new().unwrap();
    let config = mock_config(&server.url(), workspaces.path());
    (ArchiveFetcher::new(&config).unwrap(), workspaces)
}

// ── resolve_download_url ────────────────────────────────────────────────

#[test]
fn fallback_url_uses_upstream_and_branch() {
    let config = Config {
        archive_base_url: "https://archive.example.com/".into(),
        upstream: "Acme/WordPress".into(),
        default_branch: "trunk".into(),
        ..Config::default()
    };
    let fetcher = ArchiveFetcher::new(&config).unwrap();
    assert_eq!(
        fetcher.fallback_url(),
        "https://archive.example.com/Acme/WordPress/archive/refs/heads/trunk.zip"
    );
}

#[test]
fn resolve_prefers_release_zipball() {
    let mut server = mockito::Server::new();
    let _m = server
        .mock("GET", RELEASE_PATH)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"zipball_url": "https://codeload.example.com/v6.6.zip"}"#)
        .create();
    let (fetcher, _ws) = fetcher_for(&server);

    assert_eq!(fetcher.resolve_download_url(), "https://codeload.example.com/v6.6.zip");
}

#[test]
fn resolve_falls_back_on_http_error() {
    let mut server = mockito::Server::new();
    let m = server.mock("GET", RELEASE_PATH).with_status(403).expect(1).create();
    let (fetcher, _ws) = fetcher_for(&server);

    assert_eq!(fetcher.resolve_download_url(), format!("{}{}", server.url(), FALLBACK_PATH));
    m.assert();
}

#[test]
fn resolve_falls_back_on_missing_field() {
    let mut server = mockito::Server::new();
    let _m = server
        .mock("GET", RELEASE_PATH)
        .with_status(200)
        .with_body(r#"{"tag_name": "6.6"}"#)
        .create();
    let (fetcher, _ws) = fetcher_for(&server);

    assert_eq!(fetcher.resolve_download_url(), fetcher.fallback_url());
}

#[test]
fn resolve_falls_back_on_garbage_body() {
    let mut server = mockito::Server::new();
    let _m = server
        .mock("GET", RELEASE_PATH)
        .with_status(200)
        .with_body("<html>rate limited</html>")
        .create();
    let (fetcher, _ws) = fetcher_for(&server);

    assert_eq!(fetcher.resolve_download_url(), fetcher.fallback_url());
}

#[test]
fn resolve_falls_back_when_host_unreachable() {
    let workspaces = TempDir::new().unwrap();
    // Port 9 (discard) is closed on test machines; the connect fails fast.
    let config = mock_config("http://127.0.0.1:9", workspaces.path());
    let fetcher = ArchiveFetcher::new(&config).unwrap();

    assert_eq!(
        fetcher.resolve_download_url(),
        "http://127.0.0.1:9/WordPress/WordPress/archive/refs/heads/master.zip"
    );
}

// ── download ────────────────────────────────────────────────────────────

#[test]
fn download_reports_size_and_checksum() {
    let body = wordpress_zip();
    let mut server = mockito::Server::new();
    let _m = server.mock("GET", "/file.zip").with_status(200).with_body(&body).create();
    let (fetcher, ws) = fetcher_for(&server);
    let dest = ws.path().join("file.zip");

    let result = fetcher.download(&format!("{}/file.zip", server.url()), &dest).unwrap();

    assert_eq!(result.file_path, dest);
    assert_eq!(result.file_size, body.len() as u64);
    let expected: String = Sha256::digest(&body).iter().map(|b| format!("{:02x}", b)).collect();
    assert_eq!(result.checksum, expected);
    assert_eq!(fs::read(&dest).unwrap(), body);
}

#[test]
fn download_follows_redirects() {
    let mut server = mockito::Server::new();
    let _old = server
        .mock("GET", "/old.zip")
        .with_status(302)
        .with_header("location", &format!("{}/new.zip", server.url()))
        .create();
    let _new = server.mock("GET", "/new.zip").with_status(200).with_body("payload").create();
    let (fetcher, ws) = fetcher_for(&server);
    let dest = ws.path().join("out.zip");

    fetcher.download(&format!("{}/old.zip", server.url()), &dest).unwrap();
    assert_eq!(fs::read_to_string(&dest).unwrap(), "payload");
}

#[test]
fn download_error_status_fails() {
    let mut server = mockito::Server::new();
    let _m = server.mock("GET", "/missing.zip").with_status(404).create();
    let (fetcher, ws) = fetcher_for(&server);

    let url = format!("{}/missing.zip", server.url());
    let err = fetcher.download(&url, &ws.path().join("x.zip")).unwrap_err();
    assert!(format!("{:#}", err).contains(&url));
}

#[test]
fn fetch_into_returns_archive_root() {
    let mut server = mockito::Server::new();
    let _release = server.mock("GET", RELEASE_PATH).with_status(404).create();
    let _archive = server.mock("GET", FALLBACK_PATH).with_status(200).with_body(wordpress_zip()).create();
    let (fetcher, ws) = fetcher_for(&server);

    let root = fetcher.fetch_into(ws.path()).unwrap();
    assert_eq!(root, ws.path().join("extract/WordPress-WordPress-abc123"));
    assert!(root.join("wp-content/themes/twentytwentyfour/style.css").is_file());
    assert!(ws.path().join("wordpress.zip").is_file());
}

// ── extract_archive / find_archive_root ─────────────────────────────────

#[test]
fn extract_creates_parent_dirs_for_file_entries() {
    let tmp = TempDir::new().unwrap();
    let archive = tmp.path().join("a.zip");
    fs::write(&archive, zip_bytes(&[("root/deep/nested/file.txt", "x")])).unwrap();

    extract_archive(&archive, &tmp.path().join("out")).unwrap();
    assert_eq!(
        fs::read_to_string(tmp.path().join("out/root/deep/nested/file.txt")).unwrap(),
        "x"
    );
}

#[test]
fn extract_skips_entries_escaping_destination() {
    let tmp = TempDir::new().unwrap();
    let archive = tmp.path().join("a.zip");
    fs::write(&archive, zip_bytes(&[("root/ok.txt", "ok"), ("../evil.txt", "evil")])).unwrap();

    let out = tmp.path().join("out");
    extract_archive(&archive, &out).unwrap();
    assert!(out.join("root/ok.txt").is_file());
    assert!(!tmp.path().join("evil.txt").exists());
}

#[cfg(unix)]
#[test]
fn extract_keeps_unix_permissions() {
    use std::io::{Cursor, Write};
    use std::os::unix::fs::PermissionsExt;
    use zip::write::FileOptions;

    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    zip.start_file("root/wp-cli.sh", FileOptions::default().unix_permissions(0o755))
        .unwrap();
    zip.write_all(b"#!/bin/sh\n").unwrap();
    let bytes = zip.finish().unwrap().into_inner();

    let tmp = TempDir::new().unwrap();
    let archive = tmp.path().join("a.zip");
    fs::write(&archive, bytes).unwrap();
    extract_archive(&archive, &tmp.path().join("out")).unwrap();

    let mode = fs::metadata(tmp.path().join("out/root/wp-cli.sh")).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o755);
}

#[test]
fn extract_rejects_non_zip() {
    let tmp = TempDir::new().unwrap();
    let archive = tmp.path().join("a.zip");
    fs::write(&archive, "plain text").unwrap();
    assert!(extract_archive(&archive, &tmp.path().join("out")).is_err());
}

#[test]
fn archive_root_is_first_directory() {
    let tmp = TempDir::new().unwrap();
    fs::create_dir(tmp.path().join("b-dir")).unwrap();
    fs::create_dir(tmp.path().join("a-dir")).unwrap();
    fs::write(tmp.path().join("0-file"), "").unwrap();

    assert_eq!(find_archive_root(tmp.path()).unwrap(), tmp.path().join("a-dir"));
}

#[test]
fn archive_root_missing_is_error() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("index.php"), "").unwrap();

    let err = find_archive_root(tmp.path()).unwrap_err().to_string();
    assert!(err.contains("Unexpected archive layout"), "{err}");
}

#[cfg(unix)]
mod symlinks {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::FileOptions;
    use zip::CompressionMethod;

    /// Zip with a `root/` dir, one symlink entry and one file entry, in that order.
    fn zip_with_link(link: &str, target: &str, file: &str) -> Vec<u8> {
        let options = FileOptions::default().compression_method(CompressionMethod::Stored);
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        zip.add_directory("root/", options).unwrap();
        zip.add_symlink(link, target, options).unwrap();
        zip.start_file(file, options).unwrap();
        zip.write_all(b"escaped").unwrap();
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn refuses_to_write_through_symlinked_dir() {
        let outside = TempDir::new().unwrap();
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("a.zip");
        fs::write(
            &archive,
            zip_with_link("root/link", outside.path().to_str().unwrap(), "root/link/pwned.txt"),
        )
        .unwrap();

        let err = extract_archive(&archive, &tmp.path().join("out")).unwrap_err();
        assert!(format!("{:#}", err).contains("through symlink"), "{err:#}");
        assert!(!outside.path().join("pwned.txt").exists());
    }

    #[test]
    fn refuses_to_overwrite_symlinked_file() {
        let outside = TempDir::new().unwrap();
        let victim = outside.path().join("victim.txt");
        fs::write(&victim, "original").unwrap();
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("a.zip");
        fs::write(
            &archive,
            zip_with_link("root/config.php", victim.to_str().unwrap(), "root/config.php"),
        )
        .unwrap();

        assert!(extract_archive(&archive, &tmp.path().join("out")).is_err());
        assert_eq!(fs::read_to_string(&victim).unwrap(), "original");
    }

    #[test]
    fn keeps_relative_symlinks_inside_archive() {
        let options = FileOptions::default().compression_method(CompressionMethod::Stored);
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        zip.add_directory("root/", options).unwrap();
        zip.start_file("root/real.txt", options).unwrap();
        zip.write_all(b"data").unwrap();
        zip.add_symlink("root/alias.txt", "real.txt", options).unwrap();
        let bytes = zip.finish().unwrap().into_inner();

        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("a.zip");
        fs::write(&archive, bytes).unwrap();
        let out = tmp.path().join("out");
        extract_archive(&archive, &out).unwrap();

        let alias = out.join("root/alias.txt");
        assert!(fs::symlink_metadata(&alias).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_to_string(&alias).unwrap(), "data");
    }
}

//! Shared test helpers: archive fixtures, a recording cloner, mock-server config.

#![allow(dead_code)]

use anyhow::{bail, Result};
use std::cell::RefCell;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use wpseed::{license_checksum, Config, RepoCloner};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const RELEASE_PATH: &str = "/repos/WordPress/WordPress/releases/latest";
pub const FALLBACK_PATH: &str = "/WordPress/WordPress/archive/refs/heads/master.zip";

// ── Archives ─────────────────────────────────────────────────────────────

/// Zip with the given `(path, contents)` files. Paths ending in `/` become dirs.
pub fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Stored);
    for (path, contents) in entries {
        if path.ends_with('/') {
            zip.add_directory(*path, options).unwrap();
        } else {
            zip.start_file(*path, options).unwrap();
            zip.write_all(contents.as_bytes()).unwrap();
        }
    }
    zip.finish().unwrap().into_inner()
}

/// A small archive shaped like a code-host snapshot of WordPress.
pub fn wordpress_zip() -> Vec<u8> {
    zip_bytes(&[
        ("WordPress-WordPress-abc123/", ""),
        ("WordPress-WordPress-abc123/index.php", "<?php // front controller\n"),
        ("WordPress-WordPress-abc123/wp-config-sample.php", "<?php // sample\n"),
        ("WordPress-WordPress-abc123/wp-content/", ""),
        ("WordPress-WordPress-abc123/wp-content/index.php", "<?php\n"),
        (
            "WordPress-WordPress-abc123/wp-content/themes/twentytwentyfour/style.css",
            "/*\nTheme Name: Twenty Twenty-Four\nText Domain: twentytwentyfour\n*/\n",
        ),
    ])
}

// ── Cloner ───────────────────────────────────────────────────────────────

pub const FAKE_STYLESHEET: &str = "/*\nTheme Name: Fake Theme\nAuthor: Tests\n*/\nbody {}\n";

/// Records clone calls and fakes a checkout with a stylesheet and a readme.
#[derive(Default)]
pub struct FakeCloner {
    pub calls: RefCell<Vec<(String, PathBuf)>>,
    pub fail_url: Option<String>,
}

impl FakeCloner {
    pub fn failing_on(url: &str) -> Self {
        Self {
            fail_url: Some(url.to_string()),
            ..Default::default()
        }
    }

    pub fn urls(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|(url, _)| url.clone()).collect()
    }
}

impl RepoCloner for FakeCloner {
    fn clone_repo(&self, url: &str, dest: &Path) -> Result<()> {
        self.calls
            .borrow_mut()
            .push((url.to_string(), dest.to_path_buf()));
        if self.fail_url.as_deref() == Some(url) {
            bail!("git clone failed with status: exit status: 128");
        }
        fs::create_dir_all(dest)?;
        fs::write(dest.join("style.css"), FAKE_STYLESHEET)?;
        fs::write(dest.join("README.md"), format!("cloned from {}\n", url))?;
        Ok(())
    }
}

// ── Config and license ───────────────────────────────────────────────────

/// Config whose release API and archive host both point at `server_url`.
pub fn mock_config(server_url: &str, workspace_root: &Path) -> Config {
    Config {
        api_base_url: server_url.to_string(),
        archive_base_url: server_url.to_string(),
        metadata_timeout_secs: 5,
        download_timeout_secs: 5,
        workspace_root: Some(workspace_root.to_path_buf()),
        ..Config::default()
    }
}

pub fn valid_license_key() -> String {
    format!("WPS-TEST-0001-ABCD-{}", license_checksum("TEST-0001-ABCD"))
}

/// Temp dirs for a run: the project parent and the workspace root.
pub struct Sandbox {
    pub parent: TempDir,
    pub workspaces: TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        Self {
            parent: TempDir::new().unwrap(),
            workspaces: TempDir::new().unwrap(),
        }
    }

    pub fn project(&self, name: &str) -> PathBuf {
        self.parent.path().join(name)
    }

    /// No temporary workspace may outlive a run, successful or not.
    pub fn assert_no_workspace_left(&self) {
        let leftovers: Vec<_> = fs::read_dir(self.workspaces.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert!(leftovers.is_empty(), "workspace left behind: {:?}", leftovers);
    }
}

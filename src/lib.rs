//! wpseed library: core logic for provisioning WordPress project directories.
//! Downloads the WordPress source archive, installs selected themes and plugins
//! from git, writes a tailored .gitignore, and rolls back on failure.

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use dialoguer::{Confirm, Input, MultiSelect};
use regex::{Captures, Regex};
use reqwest::blocking::Client;
use reqwest::header::ACCEPT;
use reqwest::redirect::Policy;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use std::{env, thread};
use tempfile::TempDir;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub const CONFIG_ENV: &str = "WPSEED_CONFIG";
pub const LICENSE_ENV: &str = "WPSEED_LICENSE_KEY";

pub const THEMES_DIR: &str = "wp-content/themes";
pub const PLUGINS_DIR: &str = "wp-content/plugins";

// ── Config ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    /// "owner/repo" of the WordPress source on the archive host.
    pub upstream: String,
    pub default_branch: String,
    pub api_base_url: String,
    pub archive_base_url: String,
    pub metadata_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub clone_timeout_secs: u64,
    pub max_redirects: usize,
    /// Parent for temporary workspaces; the system temp dir when unset.
    pub workspace_root: Option<PathBuf>,
    pub license_key: Option<String>,
    pub themes: Vec<CatalogEntry>,
    pub plugins: Vec<CatalogEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream: "WordPress/WordPress".into(),
            default_branch: "master".into(),
            api_base_url: "https://api.github.com".into(),
            archive_base_url: "https://github.com".into(),
            metadata_timeout_secs: 30,
            download_timeout_secs: 120,
            clone_timeout_secs: 600,
            max_redirects: 5,
            workspace_root: None,
            license_key: None,
            themes: vec![CatalogEntry {
                name: "Underscores".into(),
                url: "https://github.com/Automattic/_s.git".into(),
            }],
            plugins: vec![CatalogEntry {
                name: "Query Monitor".into(),
                url: "https://github.com/johnbillion/query-monitor.git".into(),
            }],
        }
    }
}

impl Config {
    /// License key from the environment, falling back to the config file.
    pub fn license_key(&self) -> Option<String> {
        env::var(LICENSE_ENV)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| self.license_key.clone())
    }
}

pub fn config_path() -> Result<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config/wpseed/wpseed.yaml"))
}

pub fn load_config() -> Result<Config> {
    load_config_from(&config_path()?)
}

pub fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(Config::default());
    }
    serde_yaml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

// ── Logging ──────────────────────────────────────────────────────────────

/// Install the stderr log subscriber. `RUST_LOG` wins over the flags.
pub fn init_tracing(verbose: u8, quiet: bool) {
    let level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(io::stderr().is_terminal())
                .with_writer(io::stderr),
        )
        .with(filter)
        .init();
}

// ── License ──────────────────────────────────────────────────────────────

const LICENSE_PREFIX: &str = "WPS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseStatus {
    pub valid: bool,
    pub message: String,
}

impl LicenseStatus {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: message.into(),
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Checksum group for a key body such as `ABCD-1234-EFGH`.
pub fn license_checksum(body: &str) -> String {
    let digest = Sha256::digest(format!("wpseed:{}", body).as_bytes());
    to_hex(&digest[..2]).to_uppercase()
}

/// Check a `WPS-XXXX-XXXX-XXXX-CCCC` key. Never touches the network or disk.
pub fn validate_license(key: Option<&str>) -> LicenseStatus {
    let Some(key) = key.map(str::trim).filter(|k| !k.is_empty()) else {
        return LicenseStatus::invalid(format!(
            "No license key found. Set {} or add license-key to your wpseed config",
            LICENSE_ENV
        ));
    };

    let parts: Vec<&str> = key.split('-').collect();
    let well_formed = parts.len() == 5
        && parts[0] == LICENSE_PREFIX
        && parts[1..].iter().all(|group| {
            group.len() == 4
                && group
                    .chars()
                    .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
        });
    if !well_formed {
        return LicenseStatus::invalid(
            "License key is malformed (expected WPS-XXXX-XXXX-XXXX-CCCC)",
        );
    }

    if license_checksum(&parts[1..4].join("-")) != parts[4] {
        return LicenseStatus::invalid("License key is not valid (checksum mismatch)");
    }

    LicenseStatus {
        valid: true,
        message: "License key accepted".into(),
    }
}

// ── CLI ──────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(version, about = "Provision a new WordPress project with selected themes and plugins")]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Download WordPress into a new folder and install themes/plugins
    CreateProject(CreateProjectArgs),
}

#[derive(Args, Debug, Default, Clone)]
pub struct CreateProjectArgs {
    /// Target folder name (prompted for when omitted in interactive mode)
    #[arg(long)]
    pub name: Option<String>,

    /// Git repository URL of a theme to install (repeatable)
    #[arg(long = "theme", value_name = "GIT_REPO_URL")]
    pub themes: Vec<String>,

    /// Git repository URL of a plugin to install (repeatable)
    #[arg(long = "plugin", value_name = "GIT_REPO_URL")]
    pub plugins: Vec<String>,

    /// Skip writing the project .gitignore
    #[arg(long)]
    pub no_gitignore: bool,

    /// Never prompt; take everything from flags
    #[arg(short, long)]
    pub yes: bool,
}

// ── Names and slugs ──────────────────────────────────────────────────────

const FALLBACK_REPO_NAME: &str = "theme";
const RESERVED_NAME_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

static SSH_REPO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\w.-]+@[\w.-]+:(?:[^/]+/)*([^/]+)\.git$").expect("valid ssh repo regex")
});

/// Folder name for a repository URL: `git@host:org/repo.git` and
/// `https://host/org/repo/` both give `repo`.
pub fn derive_repo_name(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    if let Some(caps) = SSH_REPO_RE.captures(trimmed) {
        return caps[1].to_string();
    }

    let last = trimmed.rsplit('/').next().unwrap_or_default();
    let name = last.strip_suffix(".git").unwrap_or(last);
    if name.is_empty() {
        FALLBACK_REPO_NAME.to_string()
    } else {
        name.to_string()
    }
}

/// Lower-case ASCII slug with diacritics stripped. Empty for degenerate input.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_dash = false;

    // Lower-case first: case mapping can itself produce combining marks.
    for ch in text.to_lowercase().nfd().filter(|c| !is_combining_mark(*c)) {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch);
        } else {
            pending_dash = true;
        }
    }

    slug
}

pub fn title_from_slug(slug: &str) -> String {
    slug.replace(['-', '_'], " ")
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

pub fn validate_project_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        bail!("Project name cannot be empty");
    }
    if let Some(c) = trimmed
        .chars()
        .find(|c| RESERVED_NAME_CHARS.contains(c) || c.is_control())
    {
        bail!(
            "Project name '{}' contains invalid character '{}'",
            trimmed,
            c.escape_default()
        );
    }
    if trimmed == "." || trimmed == ".." {
        bail!("Project name '{}' is not a usable folder name", trimmed);
    }
    Ok(())
}

// ── Project request ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThemeSelection {
    pub source_url: String,
    pub folder_name: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSelection {
    pub source_url: String,
    pub folder_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRequest {
    pub project_name: String,
    pub include_gitignore: bool,
    pub themes: Vec<ThemeSelection>,
    pub plugins: Vec<PluginSelection>,
}

/// A theme the user picked, before its folder name is derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThemeChoice {
    pub url: String,
    pub display_name: Option<String>,
}

impl ThemeChoice {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            display_name: None,
        }
    }

    pub fn named(url: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            display_name: Some(display_name.into()),
        }
    }
}

pub fn theme_selection(choice: &ThemeChoice) -> Result<ThemeSelection> {
    let display_name = choice
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty());

    let folder_name = match display_name {
        Some(display) => {
            let slug = slugify(display);
            if slug.is_empty() {
                bail!("Theme name '{}' does not produce a usable folder name", display);
            }
            slug
        }
        None => derive_repo_name(&choice.url),
    };

    Ok(ThemeSelection {
        source_url: choice.url.trim().to_string(),
        folder_name,
        display_name: display_name.map(String::from),
    })
}

/// Validate the collected answers and derive every folder name.
pub fn build_request(
    name: &str,
    include_gitignore: bool,
    themes: &[ThemeChoice],
    plugin_urls: &[String],
) -> Result<ProjectRequest> {
    validate_project_name(name)?;

    let mut theme_folders = HashSet::new();
    let mut theme_selections = Vec::new();
    for choice in themes.iter().filter(|c| !c.url.trim().is_empty()) {
        let selection = theme_selection(choice)?;
        if !theme_folders.insert(selection.folder_name.clone()) {
            bail!(
                "Theme folder '{}' is selected more than once; give one of the themes a different name",
                selection.folder_name
            );
        }
        theme_selections.push(selection);
    }

    let mut plugin_folders = HashSet::new();
    let mut plugins = Vec::new();
    for url in plugin_urls.iter().map(|u| u.trim()).filter(|u| !u.is_empty()) {
        let folder_name = derive_repo_name(url);
        if !plugin_folders.insert(folder_name.clone()) {
            warn!("Plugin folder '{}' already selected, ignoring {}", folder_name, url);
            continue;
        }
        plugins.push(PluginSelection {
            source_url: url.to_string(),
            folder_name,
        });
    }

    Ok(ProjectRequest {
        project_name: name.trim().to_string(),
        include_gitignore,
        themes: theme_selections,
        plugins,
    })
}

// ── Prompts ──────────────────────────────────────────────────────────────

/// Fail when `parent/name` is already taken by anything, dangling symlinks included.
pub fn ensure_destination_free(parent: &Path, name: &str) -> Result<()> {
    let project_dir = parent.join(name.trim());
    if project_dir.symlink_metadata().is_ok() {
        bail!(
            "Destination '{}' already exists. Choose another name or remove it first.",
            project_dir.display()
        );
    }
    Ok(())
}

/// Collect a request from flags, prompting for the rest when on a terminal.
/// The project name is checked against `parent` before any other question.
pub fn resolve_request(
    args: &CreateProjectArgs,
    config: &Config,
    parent: &Path,
) -> Result<ProjectRequest> {
    let interactive = !args.yes && io::stdin().is_terminal();

    if !interactive {
        let name = args
            .name
            .as_deref()
            .context("--name is required when not running interactively")?;
        validate_project_name(name)?;
        ensure_destination_free(parent, name)?;
        let themes: Vec<ThemeChoice> = args.themes.iter().map(ThemeChoice::new).collect();
        return build_request(name, !args.no_gitignore, &themes, &args.plugins);
    }

    let name = match &args.name {
        Some(name) => {
            validate_project_name(name)?;
            ensure_destination_free(parent, name)?;
            name.clone()
        }
        None => prompt_project_name(parent)?,
    };

    let mut theme_urls = args.themes.clone();
    theme_urls.extend(prompt_catalog("Themes to install", &config.themes)?);
    let themes = prompt_theme_names(&dedup_urls(theme_urls))?;

    let mut plugin_urls = args.plugins.clone();
    plugin_urls.extend(prompt_catalog("Plugins to install", &config.plugins)?);

    let include_gitignore = !args.no_gitignore
        && Confirm::new()
            .with_prompt("Generate a .gitignore that tracks only the selected themes/plugins?")
            .default(true)
            .interact()?;

    build_request(&name, include_gitignore, &themes, &dedup_urls(plugin_urls))
}

fn dedup_urls(urls: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.into_iter()
        .filter(|url| seen.insert(url.trim().to_string()))
        .collect()
}

fn prompt_project_name(parent: &Path) -> Result<String> {
    let name: String = Input::new()
        .with_prompt("Project folder name")
        .validate_with(|input: &String| -> Result<(), String> {
            validate_project_name(input)
                .and_then(|_| ensure_destination_free(parent, input))
                .map_err(|e| e.to_string())
        })
        .interact_text()?;
    Ok(name.trim().to_string())
}

fn prompt_catalog(prompt: &str, catalog: &[CatalogEntry]) -> Result<Vec<String>> {
    if catalog.is_empty() {
        return Ok(vec![]);
    }
    let labels: Vec<String> = catalog
        .iter()
        .map(|entry| format!("{} ({})", entry.name, entry.url))
        .collect();
    let picked = MultiSelect::new()
        .with_prompt(prompt)
        .items(&labels)
        .interact()?;
    Ok(picked.into_iter().map(|i| catalog[i].url.clone()).collect())
}

/// Ask for an optional display name per theme; folder slugs must stay unique.
fn prompt_theme_names(urls: &[String]) -> Result<Vec<ThemeChoice>> {
    let mut used: HashSet<String> = HashSet::new();
    let mut choices = Vec::new();

    for url in urls {
        let repo_name = derive_repo_name(url);
        let taken = used.contains(&repo_name);
        let rename = taken
            || Confirm::new()
                .with_prompt(format!("Give theme '{}' a custom name?", repo_name))
                .default(false)
                .interact()?;

        if !rename {
            used.insert(repo_name);
            choices.push(ThemeChoice::new(url.clone()));
            continue;
        }

        let display: String = Input::new()
            .with_prompt(format!("Display name for {}", url))
            .with_initial_text(title_from_slug(&repo_name))
            .validate_with(|input: &String| -> Result<(), String> {
                let slug = slugify(input);
                if slug.is_empty() {
                    Err("Name must contain at least one letter or digit".into())
                } else if used.contains(&slug) {
                    Err(format!("Folder '{}' is already used by another theme", slug))
                } else {
                    Ok(())
                }
            })
            .interact_text()?;

        used.insert(slugify(&display));
        choices.push(ThemeChoice::named(url.clone(), display.trim()));
    }

    Ok(choices)
}

// ── Archive fetcher ──────────────────────────────────────────────────────

const ARCHIVE_FILE: &str = "wordpress.zip";
const EXTRACT_DIR: &str = "extract";

#[derive(Debug, Deserialize)]
struct ReleaseInfo {
    #[serde(default)]
    zipball_url: Option<String>,
}

#[derive(Debug)]
pub struct DownloadResult {
    pub file_path: PathBuf,
    pub file_size: u64,
    /// SHA-256 of the downloaded file, lower-case hex.
    pub checksum: String,
}

/// Resolves, downloads and extracts the WordPress source archive.
pub struct ArchiveFetcher {
    metadata_client: Client,
    download_client: Client,
    release_url: String,
    fallback_url: String,
}

impl ArchiveFetcher {
    pub fn new(config: &Config) -> Result<Self> {
        let user_agent = format!("wpseed/{}", env!("CARGO_PKG_VERSION"));

        let metadata_client = Client::builder()
            .user_agent(user_agent.clone())
            .timeout(Duration::from_secs(config.metadata_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;
        let download_client = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(config.download_timeout_secs))
            .redirect(Policy::limited(config.max_redirects))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            metadata_client,
            download_client,
            release_url: format!(
                "{}/repos/{}/releases/latest",
                config.api_base_url.trim_end_matches('/'),
                config.upstream
            ),
            fallback_url: format!(
                "{}/{}/archive/refs/heads/{}.zip",
                config.archive_base_url.trim_end_matches('/'),
                config.upstream,
                config.default_branch
            ),
        })
    }

    pub fn fallback_url(&self) -> &str {
        &self.fallback_url
    }

    fn fetch_release(&self) -> Result<ReleaseInfo> {
        let response = self
            .metadata_client
            .get(&self.release_url)
            .header(ACCEPT, "application/vnd.github+json")
            .send()
            .context("Failed to reach the release endpoint")?
            .error_for_status()
            .context("Release endpoint returned an error")?;
        serde_json::from_reader(response).context("Failed to parse release metadata")
    }

    /// Archive URL of the latest release, or the default-branch archive when
    /// the release lookup fails. Never an error.
    pub fn resolve_download_url(&self) -> String {
        match self.fetch_release() {
            Ok(ReleaseInfo {
                zipball_url: Some(url),
            }) if !url.trim().is_empty() => {
                debug!("Latest release archive: {}", url);
                url
            }
            Ok(_) => {
                warn!(
                    "Latest release has no archive URL, falling back to {}",
                    self.fallback_url
                );
                self.fallback_url.clone()
            }
            Err(e) => {
                warn!(
                    "Could not fetch latest release metadata ({:#}), falling back to {}",
                    e, self.fallback_url
                );
                self.fallback_url.clone()
            }
        }
    }

    /// Stream `url` into `dest`. The file handle is closed before returning.
    pub fn download(&self, url: &str, dest: &Path) -> Result<DownloadResult> {
        let mut response = self
            .download_client
            .get(url)
            .send()
            .with_context(|| format!("Failed to download {}", url))?
            .error_for_status()
            .with_context(|| format!("Failed to download {}", url))?;

        let file_size = {
            let file = File::create(dest)
                .with_context(|| format!("Failed to create {}", dest.display()))?;
            let mut writer = BufWriter::new(file);
            let written = io::copy(&mut response, &mut writer)
                .with_context(|| format!("Failed to save {} to {}", url, dest.display()))?;
            writer
                .flush()
                .with_context(|| format!("Failed to write {}", dest.display()))?;
            written
        };

        let checksum = file_sha256(dest)?;
        debug!("Downloaded {} bytes (sha256 {})", file_size, checksum);

        Ok(DownloadResult {
            file_path: dest.to_path_buf(),
            file_size,
            checksum,
        })
    }

    /// Download and extract into `workspace`; returns the archive's top-level dir.
    pub fn fetch_into(&self, workspace: &Path) -> Result<PathBuf> {
        let url = self.resolve_download_url();
        info!("Downloading WordPress from {}...", url);
        let archive = self.download(&url, &workspace.join(ARCHIVE_FILE))?;

        info!("Extracting archive...");
        let extract_dir = workspace.join(EXTRACT_DIR);
        extract_archive(&archive.file_path, &extract_dir)?;
        find_archive_root(&extract_dir)
    }
}

fn file_sha256(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(to_hex(&hasher.finalize()))
}

#[cfg(unix)]
fn is_symlink_mode(mode: u32) -> bool {
    const S_IFMT: u32 = 0o170000;
    const S_IFLNK: u32 = 0o120000;
    mode & S_IFMT == S_IFLNK
}

pub fn extract_archive(archive_path: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive_path)
        .with_context(|| format!("Failed to open {}", archive_path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("Invalid zip archive {}", archive_path.display()))?;
    fs::create_dir_all(dest)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).context("Failed to read zip entry")?;
        let name = entry.name().to_string();
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            warn!("Skipping archive entry with unsafe path: {}", name);
            continue;
        };
        ensure_no_symlink_on_path(dest, &relative)?;
        let out_path = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }

        #[cfg(unix)]
        {
            if entry.unix_mode().is_some_and(is_symlink_mode) {
                let mut target = String::new();
                entry
                    .read_to_string(&mut target)
                    .with_context(|| format!("Failed to extract {}", name))?;
                std::os::unix::fs::symlink(&target, &out_path)
                    .with_context(|| format!("Failed to create symlink {}", out_path.display()))?;
                continue;
            }
        }

        let mut out = File::create(&out_path)
            .with_context(|| format!("Failed to create {}", out_path.display()))?;
        io::copy(&mut entry, &mut out).with_context(|| format!("Failed to extract {}", name))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o7777))?;
            }
        }
    }

    Ok(())
}

/// Refuse entries that would be written through a symlink extracted earlier;
/// `enclosed_name` only checks the path text.
fn ensure_no_symlink_on_path(dest: &Path, relative: &Path) -> Result<()> {
    let mut current = dest.to_path_buf();
    for component in relative.components() {
        current.push(component);
        if current
            .symlink_metadata()
            .is_ok_and(|meta| meta.file_type().is_symlink())
        {
            bail!(
                "Archive entry {} would be written through symlink {}",
                relative.display(),
                current.display()
            );
        }
    }
    Ok(())
}

/// Code-host archives wrap their content in one synthetic directory.
pub fn find_archive_root(extract_dir: &Path) -> Result<PathBuf> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(extract_dir)
        .with_context(|| format!("Failed to read {}", extract_dir.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .collect();
    dirs.sort();

    dirs.into_iter().next().with_context(|| {
        format!(
            "Unexpected archive layout: no top-level directory in {}",
            extract_dir.display()
        )
    })
}

// ── Tree copy ────────────────────────────────────────────────────────────

/// Recursively copy `src` into `dest`, recreating symlinks instead of following them.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dest_path = dest.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            copy_symlink(&src_path, &dest_path)?;
        } else if file_type.is_dir() {
            copy_tree(&src_path, &dest_path)?;
        } else {
            fs::copy(&src_path, &dest_path).with_context(|| {
                format!("Failed to copy {} to {}", src_path.display(), dest_path.display())
            })?;
        }
    }

    Ok(())
}

fn copy_symlink(src: &Path, dest: &Path) -> Result<()> {
    let target = fs::read_link(src)
        .with_context(|| format!("Failed to read symlink {}", src.display()))?;

    #[cfg(unix)]
    std::os::unix::fs::symlink(&target, dest)
        .with_context(|| format!("Failed to create symlink {}", dest.display()))?;

    #[cfg(windows)]
    {
        let result = if src.is_dir() {
            std::os::windows::fs::symlink_dir(&target, dest)
        } else {
            std::os::windows::fs::symlink_file(&target, dest)
        };
        result.with_context(|| format!("Failed to create symlink {}", dest.display()))?;
    }

    Ok(())
}

// ── Git ──────────────────────────────────────────────────────────────────

const CLONE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shallow-clones a repository into a destination path.
pub trait RepoCloner {
    fn clone_repo(&self, url: &str, dest: &Path) -> Result<()>;
}

/// `git clone --depth=1` with a hard timeout.
pub struct GitCli {
    program: PathBuf,
    timeout: Duration,
}

impl GitCli {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: PathBuf::from("git"),
            timeout,
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }
}

impl RepoCloner for GitCli {
    fn clone_repo(&self, url: &str, dest: &Path) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(["clone", "--depth=1", url])
            .arg(dest)
            .env("GIT_TERMINAL_PROMPT", "0")
            .spawn()
            .context("Failed to execute git clone")?;

        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(status) = child.try_wait().context("Failed to wait for git clone")? {
                if !status.success() {
                    let _ = fs::remove_dir_all(dest);
                    bail!("git clone failed with status: {}", status);
                }
                return Ok(());
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                let _ = fs::remove_dir_all(dest);
                bail!("git clone timed out after {:?}", self.timeout);
            }
            thread::sleep(CLONE_POLL_INTERVAL);
        }
    }
}

// ── Theme metadata ───────────────────────────────────────────────────────

pub const THEME_STYLESHEET: &str = "style.css";
/// Lines scanned for the stylesheet metadata header.
pub const THEME_HEADER_MAX_LINES: usize = 200;

static THEME_NAME_RE: LazyLock<Regex> = LazyLock::new(|| header_field_regex("theme name"));
static TEXT_DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| header_field_regex("text domain"));

fn header_field_regex(label: &str) -> Regex {
    Regex::new(&format!(
        r"(?i)^(?P<prefix>\s*(?:/\*+|\*|#|//)?\s*)(?P<label>{}\s*:)\s*(?P<value>.*?)(?P<suffix>\s*\*/)?\s*$",
        label.replace(' ', r"\s+")
    ))
    .expect("valid header field regex")
}

fn split_eol(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}

/// Prefix for a new header line placed next to one with `prefix`.
fn continuation_prefix(prefix: &str) -> String {
    if prefix.trim_start().starts_with("/*") {
        prefix[..prefix.len() - prefix.trim_start().len()].to_string()
    } else {
        prefix.to_string()
    }
}

fn replace_field(caps: &Captures, value: &str, eol: &str) -> String {
    let suffix = caps.name("suffix").map_or("", |m| m.as_str());
    format!("{}{} {}{}{}", &caps["prefix"], &caps["label"], value, suffix, eol)
}

/// Rewrite `lines[idx]` with `value` and insert `label: extra` right after it.
/// A comment close on the anchor line moves down to the inserted line.
fn replace_and_insert_after(
    lines: &mut Vec<String>,
    idx: usize,
    re: &Regex,
    value: &str,
    label: &str,
    extra: &str,
    default_eol: &str,
) {
    let parts = {
        let (body, eol) = split_eol(&lines[idx]);
        re.captures(body).map(|caps| {
            let suffix = caps.name("suffix").map_or("", |m| m.as_str());
            (
                caps["prefix"].to_string(),
                caps["label"].to_string(),
                suffix.to_string(),
                eol.to_string(),
            )
        })
    };
    let Some((prefix, anchor_label, suffix, eol)) = parts else {
        return;
    };

    let anchor_eol = if eol.is_empty() { default_eol } else { eol.as_str() };
    let anchor = format!("{}{} {}{}", prefix, anchor_label, value, anchor_eol);
    let inserted = format!(
        "{}{}: {}{}{}",
        continuation_prefix(&prefix),
        label,
        extra,
        suffix,
        eol
    );
    lines[idx] = anchor;
    lines.insert(idx + 1, inserted);
}

/// Point a theme stylesheet's `Theme Name` at `display_name` and its
/// `Text Domain` at `text_domain`, adding whatever is missing.
pub fn rewrite_theme_header(content: &str, display_name: &str, text_domain: &str) -> String {
    let mut lines: Vec<String> = content.split_inclusive('\n').map(String::from).collect();
    let default_eol = if content.contains("\r\n") { "\r\n" } else { "\n" };

    let mut theme_idx = None;
    let mut domain_idx = None;
    for (i, line) in lines.iter().enumerate().take(THEME_HEADER_MAX_LINES) {
        let (body, _) = split_eol(line);
        if theme_idx.is_none() && THEME_NAME_RE.is_match(body) {
            theme_idx = Some(i);
        } else if domain_idx.is_none() && TEXT_DOMAIN_RE.is_match(body) {
            domain_idx = Some(i);
        }
        if body.trim() == "*/" {
            break;
        }
    }

    match (theme_idx, domain_idx) {
        (Some(t), Some(d)) => {
            for (idx, re, value) in [
                (t, &*THEME_NAME_RE, display_name),
                (d, &*TEXT_DOMAIN_RE, text_domain),
            ] {
                let replaced = {
                    let (body, eol) = split_eol(&lines[idx]);
                    re.captures(body).map(|caps| replace_field(&caps, value, eol))
                };
                if let Some(replaced) = replaced {
                    lines[idx] = replaced;
                }
            }
        }
        (Some(t), None) => replace_and_insert_after(
            &mut lines,
            t,
            &THEME_NAME_RE,
            display_name,
            "Text Domain",
            text_domain,
            default_eol,
        ),
        (None, Some(d)) => replace_and_insert_after(
            &mut lines,
            d,
            &TEXT_DOMAIN_RE,
            text_domain,
            "Theme Name",
            display_name,
            default_eol,
        ),
        (None, None) => {
            let header = format!(
                "/*{eol}Theme Name: {}{eol}Text Domain: {}{eol}*/{eol}",
                display_name,
                text_domain,
                eol = default_eol
            );
            return header + content;
        }
    }

    lines.concat()
}

/// Apply the chosen identity to `theme_dir/style.css`.
/// Returns false when the theme has no stylesheet.
pub fn apply_theme_identity(theme_dir: &Path, display_name: &str, text_domain: &str) -> Result<bool> {
    let stylesheet = theme_dir.join(THEME_STYLESHEET);
    if !stylesheet.is_file() {
        return Ok(false);
    }
    let content = fs::read_to_string(&stylesheet)
        .with_context(|| format!("Failed to read {}", stylesheet.display()))?;
    fs::write(&stylesheet, rewrite_theme_header(&content, display_name, text_domain))
        .with_context(|| format!("Failed to write {}", stylesheet.display()))?;
    Ok(true)
}

// ── Repository install ───────────────────────────────────────────────────

#[derive(Debug, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// Theme folders present after install, in request order.
    pub themes: Vec<String>,
    pub plugins: Vec<String>,
    /// Destinations that already existed and were not cloned.
    pub skipped: Vec<PathBuf>,
}

/// Clone into `dest` unless it exists. Returns whether a clone happened.
fn clone_unless_exists(cloner: &dyn RepoCloner, url: &str, dest: &Path) -> Result<bool> {
    if dest.symlink_metadata().is_ok() {
        warn!("{} already exists, skipping clone of {}", dest.display(), url);
        return Ok(false);
    }
    info!("Cloning {} into {}...", url, dest.display());
    cloner
        .clone_repo(url, dest)
        .with_context(|| format!("Failed to clone {}", url))?;
    Ok(true)
}

pub fn install_repositories(
    project_dir: &Path,
    request: &ProjectRequest,
    cloner: &dyn RepoCloner,
) -> Result<InstallReport> {
    let mut report = InstallReport::default();

    let themes_dir = project_dir.join(THEMES_DIR);
    if !request.themes.is_empty() {
        fs::create_dir_all(&themes_dir)
            .with_context(|| format!("Failed to create {}", themes_dir.display()))?;
    }
    for theme in &request.themes {
        let dest = themes_dir.join(&theme.folder_name);
        if !clone_unless_exists(cloner, &theme.source_url, &dest)? {
            report.skipped.push(dest.clone());
        }

        if let Some(display_name) = &theme.display_name {
            match apply_theme_identity(&dest, display_name, &theme.folder_name) {
                Ok(true) => info!("Set theme name '{}' in {}", display_name, dest.display()),
                Ok(false) => warn!(
                    "No {} in {}, theme name left unchanged",
                    THEME_STYLESHEET,
                    dest.display()
                ),
                Err(e) => warn!("Could not update theme metadata: {:#}", e),
            }
        }
        report.themes.push(theme.folder_name.clone());
    }

    let plugins_dir = project_dir.join(PLUGINS_DIR);
    if !request.plugins.is_empty() {
        fs::create_dir_all(&plugins_dir)
            .with_context(|| format!("Failed to create {}", plugins_dir.display()))?;
    }
    for plugin in &request.plugins {
        let dest = plugins_dir.join(&plugin.folder_name);
        if !clone_unless_exists(cloner, &plugin.source_url, &dest)? {
            report.skipped.push(dest);
        }
        report.plugins.push(plugin.folder_name.clone());
    }

    Ok(report)
}

// ── Gitignore ────────────────────────────────────────────────────────────

/// Ignore everything except the given theme and plugin folders.
pub fn render_gitignore(themes: &[String], plugins: &[String]) -> String {
    let mut content = String::from(
        "# WordPress project: ignore everything except selected themes/plugins\n\
         /*\n\
         !.gitignore\n\
         !wp-content/\n\
         \n\
         # In wp-content, ignore all except themes and plugins\n\
         wp-content/*\n\
         !wp-content/themes/\n\
         !wp-content/plugins/\n\
         \n\
         # Ignore all themes except the selected ones\n\
         wp-content/themes/*\n",
    );
    for name in themes.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
        content.push_str(&format!("!wp-content/themes/{}/**\n", name));
    }

    content.push_str("\n# Ignore all plugins except the selected ones\nwp-content/plugins/*\n");
    for name in plugins.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
        content.push_str(&format!("!wp-content/plugins/{}/**\n", name));
    }

    content
}

// ── Orchestration ────────────────────────────────────────────────────────

/// Removes the project directory on drop unless disarmed.
struct ProjectDirGuard {
    path: PathBuf,
    armed: bool,
}

impl ProjectDirGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for ProjectDirGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!("Removing {} due to error...", self.path.display());
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}

fn create_workspace(root: Option<&Path>) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("wpseed-");
    let workspace = match root {
        Some(root) => builder.tempdir_in(root),
        None => builder.tempdir(),
    };
    workspace.context("Failed to create temporary workspace")
}

fn populate_project(
    request: &ProjectRequest,
    project_dir: &Path,
    workspace: &Path,
    fetcher: &ArchiveFetcher,
    cloner: &dyn RepoCloner,
) -> Result<()> {
    let archive_root = fetcher.fetch_into(workspace)?;

    info!("Copying WordPress files into {}...", project_dir.display());
    copy_tree(&archive_root, project_dir)?;

    let report = install_repositories(project_dir, request, cloner)?;

    if request.include_gitignore {
        info!("Writing .gitignore...");
        let path = project_dir.join(".gitignore");
        fs::write(&path, render_gitignore(&report.themes, &report.plugins))
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }

    Ok(())
}

/// Materialize `request` under `parent`. The project directory survives only
/// if every step succeeds; the temporary workspace never survives.
pub fn create_project(
    request: &ProjectRequest,
    parent: &Path,
    fetcher: &ArchiveFetcher,
    cloner: &dyn RepoCloner,
    workspace_root: Option<&Path>,
) -> Result<PathBuf> {
    ensure_destination_free(parent, &request.project_name)?;
    let project_dir = parent.join(&request.project_name);

    info!("Creating {}...", project_dir.display());
    fs::create_dir(&project_dir)
        .with_context(|| format!("Failed to create {}", project_dir.display()))?;
    let guard = ProjectDirGuard::new(project_dir.clone());

    let workspace = create_workspace(workspace_root)?;
    debug!("Workspace: {}", workspace.path().display());

    populate_project(request, &project_dir, workspace.path(), fetcher, cloner)?;

    if let Err(e) = workspace.close() {
        warn!("Failed to remove temporary workspace: {}", e);
    }
    Ok(guard.disarm())
}

/// `create-project` handler: license gate, request collection, materialization.
pub fn run_create_project(args: &CreateProjectArgs, config: &Config, parent: &Path) -> Result<PathBuf> {
    let license = validate_license(config.license_key().as_deref());
    if !license.valid {
        bail!("{}", license.message);
    }
    debug!("{}", license.message);

    let request = resolve_request(args, config, parent)?;
    let fetcher = ArchiveFetcher::new(config)?;
    let cloner = GitCli::new(Duration::from_secs(config.clone_timeout_secs));

    create_project(
        &request,
        parent,
        &fetcher,
        &cloner,
        config.workspace_root.as_deref(),
    )
}

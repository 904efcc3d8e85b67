use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{FetchError, ProvisionError};
use crate::logging::redact_url;

const DOWNLOAD_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const DOWNLOAD_REQUEST_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);
const URL_PLACEHOLDER: &str = "{url}";
const DEST_PLACEHOLDER: &str = "{dest}";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WeightCategory {
    Checkpoints,
    Loras,
    ClipVision,
    TextEncoders,
    Vae,
    Audio,
}

impl WeightCategory {
    /// Directory under the models root the host scans for this category.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Checkpoints => "checkpoints",
            Self::Loras => "loras",
            Self::ClipVision => "clip_vision",
            Self::TextEncoders => "text_encoders",
            Self::Vae => "vae",
            Self::Audio => "audio",
        }
    }
}

impl std::fmt::Display for WeightCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WeightDescriptor {
    pub name: String,
    pub category: WeightCategory,
    pub filename: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

fn hf(repo_path: &str) -> String {
    format!("https://huggingface.co/{repo_path}")
}

fn builtin_manifest() -> Vec<WeightDescriptor> {
    let entry = |name: &str, category, url: String| WeightDescriptor {
        name: name.into(),
        category,
        filename: name.into(),
        url,
        sha256: None,
    };

    vec![
        entry(
            "Wan2_1-I2V-14B-480P_fp8_e4m3fn.safetensors",
            WeightCategory::Checkpoints,
            hf("Kijai/WanVideo_comfy/resolve/main/Wan2_1-I2V-14B-480P_fp8_e4m3fn.safetensors"),
        ),
        entry(
            "lightx2v_I2V_14B_480p_cfg_step_distill_rank64_bf16.safetensors",
            WeightCategory::Loras,
            hf("Kijai/WanVideo_comfy/resolve/main/Lightx2v/lightx2v_I2V_14B_480p_cfg_step_distill_rank64_bf16.safetensors"),
        ),
        entry(
            "Wan2_1-InfiniTetalk-Single_fp16.safetensors",
            WeightCategory::Checkpoints,
            hf("Kijai/WanVideo_comfy/resolve/main/InfiniteTalk/Wan2_1-InfiniTetalk-Single_fp16.safetensors"),
        ),
        entry(
            "clip_vision_h.safetensors",
            WeightCategory::ClipVision,
            hf("Comfy-Org/Wan_2.1_ComfyUI_repackaged/resolve/main/split_files/clip_vision/clip_vision_h.safetensors"),
        ),
        entry(
            "umt5_xxl_fp16.safetensors",
            WeightCategory::TextEncoders,
            hf("Comfy-Org/Wan_2.1_ComfyUI_repackaged/resolve/main/split_files/text_encoders/umt5_xxl_fp16.safetensors"),
        ),
        entry(
            "wan_2.1_vae.safetensors",
            WeightCategory::Vae,
            hf("Comfy-Org/Wan_2.1_ComfyUI_repackaged/resolve/main/split_files/vae/wan_2.1_vae.safetensors"),
        ),
        entry(
            "wav2vec2-chinese-base_fp16.safetensors",
            WeightCategory::Audio,
            hf("Kijai/wav2vec2_safetensors/resolve/main/wav2vec2-chinese-base_fp16.safetensors"),
        ),
    ]
}

/// The set of weights the host needs, rooted at its models directory.
#[derive(Debug, Clone)]
pub struct WeightManifest {
    models_dir: PathBuf,
    entries: Vec<WeightDescriptor>,
}

impl WeightManifest {
    pub fn new(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: Vec::new(),
        }
    }

    pub fn with_builtin_weights(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: builtin_manifest(),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn list(&self) -> &[WeightDescriptor] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&WeightDescriptor> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn destination(&self, entry: &WeightDescriptor) -> PathBuf {
        self.models_dir
            .join(entry.category.dir_name())
            .join(&entry.filename)
    }

    pub fn is_present(&self, entry: &WeightDescriptor) -> bool {
        self.destination(entry).exists()
    }

    /// Adds entries from a JSON array of descriptors; names already in the
    /// manifest are kept as they are.
    pub fn load_json(&mut self, json: &str) -> Result<()> {
        let loaded: Vec<WeightDescriptor> =
            serde_json::from_str(json).context("Failed to parse weight manifest JSON")?;
        for entry in loaded {
            if !self.entries.iter().any(|e| e.name == entry.name) {
                self.entries.push(entry);
            }
        }
        Ok(())
    }

    pub fn load_json_file(&mut self, path: &Path) -> Result<()> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read weight manifest: {}", path.display()))?;
        self.load_json(&raw)
            .with_context(|| format!("Invalid weight manifest: {}", path.display()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.entries).context("Failed to serialize weight manifest")
    }
}

/// Retrieves one remote artifact into a local file.
pub trait WeightFetcher: Send + Sync {
    fn fetch(&self, url: &str, destination: &Path) -> Result<(), FetchError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    pub fetched: Vec<String>,
    pub skipped: Vec<String>,
}

/// Makes sure every weight in `manifest` exists on disk. Present files are
/// never re-fetched; the first failure aborts provisioning.
pub fn provision(
    manifest: &WeightManifest,
    fetcher: &dyn WeightFetcher,
) -> Result<ProvisionReport, ProvisionError> {
    let mut report = ProvisionReport::default();

    for entry in manifest.list() {
        let destination = manifest.destination(entry);
        if destination.exists() {
            debug!(weight = %entry.name, path = %destination.display(), "Weight already present");
            report.skipped.push(entry.name.clone());
            continue;
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|source| ProvisionError::Io {
                name: entry.name.clone(),
                path: parent.to_path_buf(),
                source,
            })?;
        }

        info!(
            weight = %entry.name,
            url = %redact_url(&entry.url),
            path = %destination.display(),
            "Downloading weight"
        );
        fetcher
            .fetch(&entry.url, &destination)
            .map_err(|source| ProvisionError::Fetch {
                name: entry.name.clone(),
                source,
            })?;

        if let Some(expected) = &entry.sha256 {
            verify_checksum(&entry.name, &destination, expected)?;
        } else {
            debug!(weight = %entry.name, "No SHA256 configured; skipping verification");
        }

        info!(weight = %entry.name, "Weight ready");
        report.fetched.push(entry.name.clone());
    }

    Ok(report)
}

fn verify_checksum(name: &str, path: &Path, expected: &str) -> Result<(), ProvisionError> {
    let actual = sha256_file(path).map_err(|source| ProvisionError::Io {
        name: name.to_string(),
        path: path.to_path_buf(),
        source,
    })?;
    if !actual.eq_ignore_ascii_case(expected) {
        let _ = fs::remove_file(path);
        return Err(ProvisionError::Checksum {
            name: name.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Streams the response body into `<dest>.part` and renames it into place
/// once fully written.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher;

impl WeightFetcher for HttpFetcher {
    fn fetch(&self, url: &str, destination: &Path) -> Result<(), FetchError> {
        let shown = redact_url(url);
        let transport = |err: reqwest::Error| FetchError::Transport {
            url: shown.clone(),
            message: err.without_url().to_string(),
        };
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| FetchError::Io { path, source }
        };

        let client = reqwest::blocking::Client::builder()
            .connect_timeout(DOWNLOAD_CONNECT_TIMEOUT)
            .timeout(DOWNLOAD_REQUEST_TIMEOUT)
            .build()
            .map_err(transport)?;

        let mut response = client.get(url).send().map_err(transport)?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: shown.clone(),
                status: response.status().as_u16(),
            });
        }

        let tmp_path = part_path(destination);
        let mut tmp_file = fs::File::create(&tmp_path).map_err(io_err(&tmp_path))?;
        let mut guard = PartFileGuard::new(&tmp_path);

        response.copy_to(&mut tmp_file).map_err(transport)?;
        tmp_file.flush().map_err(io_err(&tmp_path))?;
        tmp_file.sync_all().map_err(io_err(&tmp_path))?;
        drop(tmp_file);

        fs::rename(&tmp_path, destination).map_err(io_err(destination))?;
        guard.disarm();
        Ok(())
    }
}

/// Delegates to an external download utility such as `pget`. `{url}` and
/// `{dest}` in `args` are substituted; empty `args` means `<url> <dest>`.
#[derive(Debug, Clone)]
pub struct CommandFetcher {
    program: String,
    args: Vec<String>,
}

impl CommandFetcher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn render_args(&self, url: &str, destination: &Path) -> Vec<String> {
        let dest = destination.to_string_lossy();
        if self.args.is_empty() {
            return vec![url.to_string(), dest.into_owned()];
        }
        self.args
            .iter()
            .map(|arg| {
                arg.replace(URL_PLACEHOLDER, url)
                    .replace(DEST_PLACEHOLDER, &dest)
            })
            .collect()
    }
}

impl WeightFetcher for CommandFetcher {
    fn fetch(&self, url: &str, destination: &Path) -> Result<(), FetchError> {
        let args = self.render_args(url, destination);
        debug!(command = %self.program, url = %redact_url(url), "Running external fetch command");

        let status = Command::new(&self.program)
            .args(&args)
            .status()
            .map_err(|source| FetchError::Spawn {
                command: self.program.clone(),
                source,
            })?;

        if !status.success() {
            let _ = fs::remove_file(destination);
            return Err(FetchError::CommandFailed {
                command: self.program.clone(),
                status: status.to_string(),
            });
        }
        if !destination.exists() {
            warn!(command = %self.program, path = %destination.display(), "Fetch command produced no file");
            return Err(FetchError::NotProduced {
                command: self.program.clone(),
                path: destination.to_path_buf(),
            });
        }
        Ok(())
    }
}

/// Builds the fetcher selected by configuration.
pub fn fetcher_for(command: Option<&str>, args: &[String]) -> Box<dyn WeightFetcher> {
    match command {
        Some(program) if !program.trim().is_empty() => {
            Box::new(CommandFetcher::new(program.trim(), args.to_vec()))
        }
        _ => Box::new(HttpFetcher),
    }
}

fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

struct PartFileGuard<'a> {
    path: &'a Path,
    keep: bool,
}

impl<'a> PartFileGuard<'a> {
    fn new(path: &'a Path) -> Self {
        Self { path, keep: false }
    }

    fn disarm(&mut self) {
        self.keep = true;
    }
}

impl Drop for PartFileGuard<'_> {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_file(self.path);
        }
    }
}

//! Packaging a configuration directory with an engine into a deployable unit.
//!
//! Container kinds get a tar build context (`Dockerfile` plus `config/`) that
//! the runtime turns into an image. The serverless kind gets a zip: the
//! engine's pre-built package with `config/` appended.

use bollard::image::BuildImageOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tar::Header;
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{EngineError, Result};

/// Where the configuration lives inside an engine image.
pub const CONFIG_MOUNT: &str = "/opt/engine/config";
const CONFIG_PREFIX: &str = "config";
pub const BUILT_WITH_LABEL: &str = "builtwith";

/// Files under `config_dir` as (archive name, host path), sorted by name.
/// Archive names use `/` separators and start with `config/`.
pub fn config_entries(config_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    if !config_dir.is_dir() {
        return Err(EngineError::Config(format!(
            "config directory {} does not exist",
            config_dir.display()
        )));
    }

    let mut entries = Vec::new();
    for entry in WalkDir::new(config_dir).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(config_dir)
            .map_err(|e| EngineError::Config(e.to_string()))?;
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        entries.push((format!("{CONFIG_PREFIX}/{name}"), entry.path().to_path_buf()));
    }
    Ok(entries)
}

pub fn dockerfile(image: &str, version: &str) -> String {
    format!("FROM {image}:{version}\nCOPY {CONFIG_PREFIX} {CONFIG_MOUNT}\n")
}

/// In-memory tar stream holding the Dockerfile and the config tree.
pub fn build_context(config_dir: &Path, image: &str, version: &str) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    let dockerfile = dockerfile(image, version);
    let mut header = Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    builder.append_data(&mut header, "Dockerfile", dockerfile.as_bytes())?;

    for (name, path) in config_entries(config_dir)? {
        let meta = fs::metadata(&path)?;
        let mut header = Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(meta.len());
        header.set_mode(0o644);
        header.set_mtime(0);
        builder.append_data(&mut header, &name, File::open(&path)?)?;
    }

    Ok(builder.into_inner()?)
}

/// Submit a build context to the runtime, tag the result `tag` and label it
/// with the engine it was built from. Any `error` event fails the build.
pub async fn build_image(
    docker: &Docker,
    context: Vec<u8>,
    tag: &str,
    built_with: &str,
) -> Result<()> {
    let options = BuildImageOptions {
        dockerfile: "Dockerfile".to_string(),
        t: tag.to_string(),
        rm: true,
        labels: HashMap::from([(BUILT_WITH_LABEL.to_string(), built_with.to_string())]),
        ..Default::default()
    };

    info!(tag = %tag, built_with = %built_with, "Building image");
    let mut events = docker.build_image(options, None, Some(context.into()));
    while let Some(event) = events.next().await {
        let event = event?;
        if let Some(error) = event.error {
            return Err(EngineError::Lifecycle(format!("image build failed: {error}")));
        }
        if let Some(line) = event.stream {
            let line = line.trim_end();
            if !line.is_empty() {
                debug!(tag = %tag, "{}", line);
            }
        }
    }
    info!(tag = %tag, "Image built");
    Ok(())
}

/// Copy the engine package at `engine_zip` into `dest`, skipping directory
/// entries, then append the config tree under `config/`.
///
/// Fails with [`EngineError::AlreadyExists`] when `dest` is present.
pub fn zip_bundle(engine_zip: &Path, config_dir: &Path, dest: &Path) -> Result<()> {
    let config = config_entries(config_dir)?;
    let mut source = ZipArchive::new(File::open(engine_zip)?)?;

    let file = match OpenOptions::new().write(true).create_new(true).open(dest) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(EngineError::AlreadyExists(dest.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };

    let result = write_zip(file, &mut source, &config);
    if result.is_err() {
        let _ = fs::remove_file(dest);
    }
    result
}

fn write_zip(
    file: File,
    source: &mut ZipArchive<File>,
    config: &[(String, PathBuf)],
) -> Result<()> {
    let mut writer = ZipWriter::new(file);

    let mut copied = 0usize;
    for index in 0..source.len() {
        let entry = source.by_index_raw(index)?;
        // some packagers emit empty directory headers the runtime rejects
        if entry.is_dir() {
            continue;
        }
        writer.raw_copy_file(entry)?;
        copied += 1;
    }

    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);
    for (name, path) in config {
        writer.start_file(name.as_str(), options)?;
        writer.write_all(&fs::read(path)?)?;
    }

    writer.finish()?;
    debug!(engine_entries = copied, config_entries = config.len(), "Zip bundle written");
    Ok(())
}

use crate::model::{ResultFile, ResultKey};
use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn result_path(dir: &Path, key: &ResultKey) -> PathBuf {
    dir.join(key.file_name())
}

/// Missing files read as empty.
pub fn load_result_file(path: &Path) -> Result<ResultFile> {
    if !path.exists() {
        return Ok(ResultFile::default());
    }
    load_json(path)
}

pub fn save_result_file(path: &Path, file: &ResultFile) -> Result<()> {
    save_json(path, file)
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse json in {}", path.display()))
}

pub fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    let serialized = serde_json::to_string_pretty(value)?;
    std::fs::write(path, serialized)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Result files of one region and year, sorted by name. Files whose names do
/// not parse as result keys are ignored.
pub fn list_region_year(dir: &Path, region: &str, year: i32) -> Result<Vec<(ResultKey, PathBuf)>> {
    let pattern = format!(
        "{}/{}_*_{year}.json",
        glob::Pattern::escape(&dir.to_string_lossy()),
        glob::Pattern::escape(region)
    );

    let mut files = Vec::new();
    for entry in glob::glob(&pattern).with_context(|| format!("invalid glob pattern {pattern}"))? {
        let path = entry.with_context(|| format!("failed to read entry matching {pattern}"))?;
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let Some(key) = ResultKey::parse(name) else {
            continue;
        };
        if key.region == region && key.year == year {
            files.push((key, path));
        }
    }
    files.sort();
    Ok(files)
}

/// One entry per line; blank lines skipped. Missing files read as empty.
pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

pub fn write_lines<S: AsRef<str>>(path: &Path, lines: &[S]) -> Result<()> {
    ensure_parent(path)?;
    let mut content = String::new();
    for line in lines {
        content.push_str(line.as_ref());
        content.push('\n');
    }
    std::fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
}

pub fn write_gzip_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    serde_json::to_writer(&mut encoder, value)
        .with_context(|| format!("failed to serialize into {}", path.display()))?;
    encoder
        .finish()
        .and_then(|mut file| file.flush())
        .with_context(|| format!("failed to finish gzip stream {}", path.display()))?;
    Ok(())
}

pub fn read_gzip_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    serde_json::from_reader(flate2::read::GzDecoder::new(file))
        .with_context(|| format!("failed to decode gzip json in {}", path.display()))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    Ok(())
}

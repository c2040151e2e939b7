//! In-process archive operations scoped to a stack directory.
//!
//! `create-archive` and `extract-archive` run inside the agent rather than
//! through the engine CLI. All paths involved are forced under the stack
//! root, extraction refuses traversal per entry, and both directions emit
//! progress through the operation broadcaster.

mod create;
mod extract;

pub use create::create_archive;
pub use extract::extract_archive;

use crate::stack::StackPathError;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("missing required option {0}")]
    MissingOption(&'static str),

    #[error("cannot determine archive format for {0:?}")]
    UnknownFormat(PathBuf),

    #[error("invalid exclude pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        source: globset::Error,
    },

    #[error(transparent)]
    Path(#[from] StackPathError),

    #[error("archive IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    Zip,
}

impl ArchiveFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "tar" => Some(Self::Tar),
            "tar.gz" => Some(Self::TarGz),
            "zip" => Some(Self::Zip),
            _ => None,
        }
    }

    /// Detect a format from a file name: `.zip`, `.tar.gz`/`.tgz`, `.tar`.
    pub fn from_extension(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(Self::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if name.ends_with(".tar") {
            Some(Self::Tar)
        } else {
            None
        }
    }
}

/// Parsed `create-archive` options.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub format: ArchiveFormat,
    pub output: PathBuf,
    pub includes: Vec<PathBuf>,
    pub excludes: Vec<String>,
}

/// Parsed `extract-archive` options.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub archive: PathBuf,
    pub destination: PathBuf,
    pub overwrite: bool,
    pub create_dirs: bool,
}

/// Walk an already-validated option list as `--flag value` / `--flag=value`
/// pairs. Validation guarantees shape; this only extracts.
fn option_pairs(options: &[String]) -> Vec<(String, Option<String>)> {
    let mut pairs = Vec::new();
    let mut iter = options.iter();
    while let Some(token) = iter.next() {
        if let Some((name, value)) = token.split_once('=') {
            if name.starts_with('-') {
                pairs.push((name.to_string(), Some(value.to_string())));
                continue;
            }
        }
        let takes_value = matches!(
            token.as_str(),
            "--format" | "--compression" | "--output" | "--include" | "--exclude" | "--archive"
                | "--destination"
        );
        if takes_value {
            let value = iter.next().cloned();
            pairs.push((token.clone(), value));
        } else {
            pairs.push((token.clone(), None));
        }
    }
    pairs
}

impl CreateOptions {
    pub fn parse(options: &[String]) -> Result<Self, ArchiveError> {
        let mut format = None;
        let mut compression: Option<String> = None;
        let mut output = None;
        let mut includes = Vec::new();
        let mut excludes = Vec::new();

        for (name, value) in option_pairs(options) {
            match name.as_str() {
                "--format" => format = value.as_deref().and_then(ArchiveFormat::parse),
                "--compression" => compression = value,
                "--output" => output = value.map(PathBuf::from),
                "--include" => {
                    if let Some(value) = value {
                        includes.push(PathBuf::from(value));
                    }
                }
                "--exclude" => {
                    if let Some(value) = value {
                        excludes.push(value);
                    }
                }
                _ => {}
            }
        }

        let output = output.ok_or(ArchiveError::MissingOption("--output"))?;

        let mut format = match format {
            Some(format) => format,
            None => ArchiveFormat::from_extension(&output)
                .ok_or_else(|| ArchiveError::UnknownFormat(output.clone()))?,
        };
        // `--compression gzip` upgrades a plain tar; `none` downgrades one.
        match compression.as_deref() {
            Some("gzip") if format == ArchiveFormat::Tar => format = ArchiveFormat::TarGz,
            Some("none") if format == ArchiveFormat::TarGz => format = ArchiveFormat::Tar,
            _ => {}
        }

        if includes.is_empty() {
            includes.push(PathBuf::from("."));
        }

        Ok(Self {
            format,
            output,
            includes,
            excludes,
        })
    }
}

impl ExtractOptions {
    pub fn parse(options: &[String]) -> Result<Self, ArchiveError> {
        let mut archive = None;
        let mut destination = None;
        let mut overwrite = false;
        let mut create_dirs = false;

        for (name, value) in option_pairs(options) {
            match name.as_str() {
                "--archive" => archive = value.map(PathBuf::from),
                "--destination" => destination = value.map(PathBuf::from),
                "--overwrite" => overwrite = true,
                "--create-dirs" => create_dirs = true,
                _ => {}
            }
        }

        Ok(Self {
            archive: archive.ok_or(ArchiveError::MissingOption("--archive"))?,
            destination: destination.unwrap_or_else(|| PathBuf::from(".")),
            overwrite,
            create_dirs,
        })
    }

    pub fn format(&self) -> Result<ArchiveFormat, ArchiveError> {
        ArchiveFormat::from_extension(&self.archive)
            .ok_or_else(|| ArchiveError::UnknownFormat(self.archive.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn create_options_parse_with_explicit_format() {
        let opts = CreateOptions::parse(&strings(&[
            "--format",
            "tar.gz",
            "--output",
            "out.tgz",
            "--include",
            ".",
            "--exclude",
            "*.log",
        ]))
        .unwrap();
        assert_eq!(opts.format, ArchiveFormat::TarGz);
        assert_eq!(opts.output, PathBuf::from("out.tgz"));
        assert_eq!(opts.excludes, vec!["*.log".to_string()]);
    }

    #[test]
    fn create_format_falls_back_to_extension() {
        let opts = CreateOptions::parse(&strings(&["--output", "backup.zip"])).unwrap();
        assert_eq!(opts.format, ArchiveFormat::Zip);
        assert_eq!(opts.includes, vec![PathBuf::from(".")]);
    }

    #[test]
    fn compression_flag_adjusts_tar() {
        let opts =
            CreateOptions::parse(&strings(&["--format", "tar", "--compression", "gzip", "--output", "o.tar"]))
                .unwrap();
        assert_eq!(opts.format, ArchiveFormat::TarGz);
    }

    #[test]
    fn create_requires_output() {
        let err = CreateOptions::parse(&strings(&["--format", "tar"])).unwrap_err();
        assert!(matches!(err, ArchiveError::MissingOption("--output")));
    }

    #[test]
    fn extract_options_parse() {
        let opts = ExtractOptions::parse(&strings(&[
            "--archive",
            "backup.tar.gz",
            "--destination",
            "restore",
            "--overwrite",
            "--create-dirs",
        ]))
        .unwrap();
        assert_eq!(opts.format().unwrap(), ArchiveFormat::TarGz);
        assert!(opts.overwrite);
        assert!(opts.create_dirs);
    }

    #[test]
    fn extension_detection() {
        assert_eq!(
            ArchiveFormat::from_extension(Path::new("a.zip")),
            Some(ArchiveFormat::Zip)
        );
        assert_eq!(
            ArchiveFormat::from_extension(Path::new("a.tar.gz")),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(
            ArchiveFormat::from_extension(Path::new("a.tgz")),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(
            ArchiveFormat::from_extension(Path::new("a.tar")),
            Some(ArchiveFormat::Tar)
        );
        assert_eq!(ArchiveFormat::from_extension(Path::new("a.rar")), None);
    }
}

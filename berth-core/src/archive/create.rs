//! Archive creation: walk include paths under the stack root and write
//! tar, tar.gz, or zip output with progress events.

use super::{ArchiveError, ArchiveFormat, CreateOptions};
use crate::broadcast::{Broadcaster, OperationMessage};
use crate::stack;
use flate2::Compression;
use flate2::write::GzEncoder;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::WalkDir;

const PROGRESS_EVERY: u64 = 100;

enum WalkItem {
    /// `(absolute, relative-to-stack-root)`
    Entry(PathBuf, PathBuf),
    /// A walk error attributable to a single entry.
    Unreadable(String),
}

/// Create an archive of the stack directory per `opts`.
///
/// Blocking: run it on a blocking thread. Entries that fail to read are
/// reported as error-tagged progress messages and skipped; only output
/// failures and cancellation abort the run. Returns the number of entries
/// written.
pub fn create_archive(
    stack_dir: &Path,
    opts: &CreateOptions,
    broadcaster: &Broadcaster,
    cancel: &CancellationToken,
) -> Result<u64, ArchiveError> {
    let output = stack::resolve_subpath(stack_dir, &opts.output)?;
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let excludes = build_excludes(&opts.excludes)?;
    let items = walk_includes(stack_dir, opts, &excludes, &output)?;

    let count = match opts.format {
        ArchiveFormat::Tar => {
            let file = BufWriter::new(File::create(&output)?);
            let mut builder = tar::Builder::new(file);
            builder.follow_symlinks(false);
            let count = write_tar(&mut builder, items, broadcaster, cancel)?;
            builder.into_inner()?.flush()?;
            count
        }
        ArchiveFormat::TarGz => {
            let file = BufWriter::new(File::create(&output)?);
            let encoder = GzEncoder::new(file, Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder.follow_symlinks(false);
            let count = write_tar(&mut builder, items, broadcaster, cancel)?;
            builder.into_inner()?.finish()?.flush()?;
            count
        }
        ArchiveFormat::Zip => {
            let mut writer = zip::ZipWriter::new(File::create(&output)?);
            let count = write_zip(&mut writer, items, broadcaster, cancel)?;
            writer.finish()?;
            count
        }
    };

    debug!(output = %output.display(), count, "archive created");
    Ok(count)
}

fn build_excludes(patterns: &[String]) -> Result<GlobSet, ArchiveError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(false)
            .build()
            .map_err(|source| ArchiveError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|source| ArchiveError::InvalidPattern {
            pattern: String::new(),
            source,
        })
}

/// Walk every include path, yielding entries relative to the stack root,
/// minus excluded paths and the output file itself.
fn walk_includes(
    stack_dir: &Path,
    opts: &CreateOptions,
    excludes: &GlobSet,
    output: &Path,
) -> Result<Vec<WalkItem>, ArchiveError> {
    let mut items = Vec::new();
    for include in &opts.includes {
        let base = stack::resolve_subpath(stack_dir, include)?;
        for entry in WalkDir::new(&base).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    items.push(WalkItem::Unreadable(format!("error: {e}")));
                    continue;
                }
            };
            let path = entry.path();
            if path == output {
                continue;
            }
            let rel = match path.strip_prefix(stack_dir) {
                Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
                _ => continue,
            };
            if excludes.is_match(&rel) {
                continue;
            }
            items.push(WalkItem::Entry(path.to_path_buf(), rel));
        }
    }
    Ok(items)
}

fn write_tar<W: Write>(
    builder: &mut tar::Builder<W>,
    items: Vec<WalkItem>,
    broadcaster: &Broadcaster,
    cancel: &CancellationToken,
) -> Result<u64, ArchiveError> {
    let mut count = 0u64;
    for item in items {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        let (path, rel) = match item {
            WalkItem::Entry(path, rel) => (path, rel),
            WalkItem::Unreadable(message) => {
                broadcaster.broadcast(OperationMessage::progress(message));
                continue;
            }
        };

        let file_type = match path.symlink_metadata() {
            Ok(metadata) => metadata.file_type(),
            Err(e) => {
                broadcaster.broadcast(OperationMessage::progress(format!(
                    "error: failed to stat {}: {e}",
                    rel.display()
                )));
                continue;
            }
        };

        let result = if file_type.is_dir() {
            builder.append_dir(&rel, &path)
        } else {
            // Regular files and symlinks; the builder stores links as link
            // entries since follow_symlinks is off.
            builder.append_path_with_name(&path, &rel)
        };
        if let Err(e) = result {
            broadcaster.broadcast(OperationMessage::progress(format!(
                "error: failed to archive {}: {e}",
                rel.display()
            )));
            continue;
        }

        count += 1;
        if count % PROGRESS_EVERY == 0 {
            broadcaster.broadcast(OperationMessage::stdout(format!("archived {count} entries")));
        }
    }
    Ok(count)
}

fn write_zip(
    writer: &mut zip::ZipWriter<File>,
    items: Vec<WalkItem>,
    broadcaster: &Broadcaster,
    cancel: &CancellationToken,
) -> Result<u64, ArchiveError> {
    use zip::write::SimpleFileOptions;

    let mut count = 0u64;
    for item in items {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        let (path, rel) = match item {
            WalkItem::Entry(path, rel) => (path, rel),
            WalkItem::Unreadable(message) => {
                broadcaster.broadcast(OperationMessage::progress(message));
                continue;
            }
        };

        let metadata = match path.symlink_metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                broadcaster.broadcast(OperationMessage::progress(format!(
                    "error: failed to stat {}: {e}",
                    rel.display()
                )));
                continue;
            }
        };

        let name = rel.to_string_lossy().replace('\\', "/");
        let mut options = SimpleFileOptions::default();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            options = options.unix_permissions(metadata.permissions().mode() & 0o7777);
        }

        if metadata.file_type().is_dir() {
            writer.add_directory(format!("{name}/"), options)?;
        } else if metadata.file_type().is_symlink() {
            // Symlinks are not materialised into zip output.
            broadcaster.broadcast(OperationMessage::stdout(format!(
                "skipping symlink {}",
                rel.display()
            )));
            continue;
        } else {
            let mut source = match File::open(&path) {
                Ok(source) => source,
                Err(e) => {
                    broadcaster.broadcast(OperationMessage::progress(format!(
                        "error: failed to archive {}: {e}",
                        rel.display()
                    )));
                    continue;
                }
            };
            writer.start_file(name.as_str(), options)?;
            std::io::copy(&mut source, writer)?;
        }

        count += 1;
        if count % PROGRESS_EVERY == 0 {
            broadcaster.broadcast(OperationMessage::stdout(format!("archived {count} entries")));
        }
    }
    Ok(count)
}

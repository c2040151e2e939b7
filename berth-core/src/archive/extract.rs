//! Archive extraction with per-entry traversal checks.
//!
//! Every entry's destination is re-validated against the destination root;
//! an entry that would escape is skipped with a user-visible message rather
//! than aborting the whole run. Symlinks are only recreated when their
//! target stays inside the destination.

use super::{ArchiveError, ArchiveFormat, ExtractOptions};
use crate::broadcast::{Broadcaster, OperationMessage};
use crate::stack;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Extract an archive into the stack directory per `opts`.
///
/// Blocking: run it on a blocking thread. Returns the number of entries
/// written.
pub fn extract_archive(
    stack_dir: &Path,
    opts: &ExtractOptions,
    broadcaster: &Broadcaster,
    cancel: &CancellationToken,
) -> Result<u64, ArchiveError> {
    let archive_path = stack::resolve_subpath(stack_dir, &opts.archive)?;
    let destination = stack::resolve_subpath(stack_dir, &opts.destination)?;

    if !destination.exists() {
        if opts.create_dirs {
            std::fs::create_dir_all(&destination)?;
        } else {
            return Err(ArchiveError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("destination {} does not exist", destination.display()),
            )));
        }
    }
    let destination = destination.canonicalize()?;

    let format = opts.format()?;
    let count = match format {
        ArchiveFormat::Tar => {
            let file = File::open(&archive_path)?;
            extract_tar(tar::Archive::new(file), &destination, opts, broadcaster, cancel)?
        }
        ArchiveFormat::TarGz => {
            let file = File::open(&archive_path)?;
            extract_tar(
                tar::Archive::new(GzDecoder::new(file)),
                &destination,
                opts,
                broadcaster,
                cancel,
            )?
        }
        ArchiveFormat::Zip => extract_zip(&archive_path, &destination, opts, broadcaster, cancel)?,
    };

    debug!(archive = %archive_path.display(), count, "archive extracted");
    Ok(count)
}

/// Lexically clean an entry path, refusing anything that would step out of
/// the destination.
fn sanitize_entry_path(entry: &Path) -> Option<PathBuf> {
    let mut cleaned = PathBuf::new();
    for component in entry.components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if cleaned.as_os_str().is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Verify that writing through `target`'s parent cannot escape `root` via a
/// previously-extracted symlink.
fn parent_contained(root: &Path, target: &Path) -> bool {
    let Some(parent) = target.parent() else {
        return false;
    };
    match parent.canonicalize() {
        Ok(canonical) => canonical.starts_with(root),
        // Parent does not exist yet: it will be created below `root` since
        // the lexical path is already clean.
        Err(_) => true,
    }
}

fn ensure_parent(target: &Path) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777));
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

fn skip(broadcaster: &Broadcaster, reason: String) {
    broadcaster.broadcast(OperationMessage::stdout(reason));
}

fn extract_tar<R: Read>(
    mut archive: tar::Archive<R>,
    destination: &Path,
    opts: &ExtractOptions,
    broadcaster: &Broadcaster,
    cancel: &CancellationToken,
) -> Result<u64, ArchiveError> {
    let mut count = 0u64;
    for entry in archive.entries()? {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        let mut entry = entry?;
        let raw_path = entry.path()?.into_owned();

        let Some(rel) = sanitize_entry_path(&raw_path) else {
            skip(
                broadcaster,
                format!("skipping entry outside destination: {}", raw_path.display()),
            );
            continue;
        };
        let target = destination.join(&rel);
        if !stack::is_within(destination, &target) || !parent_contained(destination, &target) {
            skip(
                broadcaster,
                format!("skipping entry outside destination: {}", raw_path.display()),
            );
            continue;
        }

        let header = entry.header();
        let mode = header.mode().unwrap_or(0o644);
        let entry_type = header.entry_type();

        if entry_type.is_dir() {
            std::fs::create_dir_all(&target)?;
            set_mode(&target, mode);
            count += 1;
        } else if entry_type.is_symlink() {
            let Some(link) = entry.link_name()? else {
                continue;
            };
            if !symlink_target_contained(destination, &target, &link) {
                skip(
                    broadcaster,
                    format!(
                        "skipping symlink {} pointing outside destination",
                        raw_path.display()
                    ),
                );
                continue;
            }
            ensure_parent(&target)?;
            if target.exists() && !opts.overwrite {
                continue;
            }
            #[cfg(unix)]
            {
                let _ = std::fs::remove_file(&target);
                std::os::unix::fs::symlink(&link, &target)?;
            }
            count += 1;
        } else if entry_type.is_file() {
            if target.exists() && !opts.overwrite {
                continue;
            }
            ensure_parent(&target)?;
            let mut file = File::create(&target)?;
            std::io::copy(&mut entry, &mut file)?;
            set_mode(&target, mode);
            count += 1;
        }
        // Hard links, fifos, and devices are not recreated.

        if count > 0 && count % 100 == 0 {
            broadcaster.broadcast(OperationMessage::stdout(format!("extracted {count} entries")));
        }
    }
    Ok(count)
}

/// A symlink is only recreated when its target, resolved relative to the
/// link location, stays inside the destination root.
fn symlink_target_contained(root: &Path, link_path: &Path, target: &Path) -> bool {
    if target.is_absolute() {
        return target.starts_with(root);
    }
    let Some(base) = link_path.parent() else {
        return false;
    };
    let mut resolved = base.to_path_buf();
    for component in target.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return false;
                }
            }
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    resolved.starts_with(root)
}

fn extract_zip(
    archive_path: &Path,
    destination: &Path,
    opts: &ExtractOptions,
    broadcaster: &Broadcaster,
    cancel: &CancellationToken,
) -> Result<u64, ArchiveError> {
    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let mut count = 0u64;
    for index in 0..archive.len() {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        let mut entry = archive.by_index(index)?;

        let Some(rel) = entry.enclosed_name().and_then(|p| sanitize_entry_path(&p)) else {
            skip(
                broadcaster,
                format!("skipping entry outside destination: {}", entry.name()),
            );
            continue;
        };
        let target = destination.join(&rel);
        if !parent_contained(destination, &target) {
            skip(
                broadcaster,
                format!("skipping entry outside destination: {}", entry.name()),
            );
            continue;
        }

        let mode = entry.unix_mode().unwrap_or(0o644);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            set_mode(&target, mode);
            count += 1;
        } else {
            if target.exists() && !opts.overwrite {
                continue;
            }
            ensure_parent(&target)?;
            let mut file = File::create(&target)?;
            std::io::copy(&mut entry, &mut file)?;
            set_mode(&target, mode);
            count += 1;
        }

        if count > 0 && count % 100 == 0 {
            broadcaster.broadcast(OperationMessage::stdout(format!("extracted {count} entries")));
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::super::{CreateOptions, create_archive};
    use super::*;
    use std::sync::Arc;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn populate_stack(stack: &Path) {
        std::fs::create_dir_all(stack.join("data/sub")).unwrap();
        std::fs::write(stack.join("compose.yaml"), "services: {}\n").unwrap();
        std::fs::write(stack.join("data/app.db"), b"database").unwrap();
        std::fs::write(stack.join("data/sub/notes.txt"), b"notes").unwrap();
        std::fs::write(stack.join("debug.log"), b"log").unwrap();
    }

    fn roundtrip(format_args: &[&str], output: &str) {
        let root = tempfile::tempdir().unwrap();
        let stack = root.path().join("stk");
        populate_stack(&stack);

        let broadcaster = Arc::new(Broadcaster::new());
        let cancel = CancellationToken::new();

        let mut create_args = strings(format_args);
        create_args.extend(strings(&["--output", output, "--include", ".", "--exclude", "*.log"]));
        let opts = CreateOptions::parse(&create_args).unwrap();
        let written = create_archive(&stack, &opts, &broadcaster, &cancel).unwrap();
        assert!(written >= 4, "expected at least 4 entries, wrote {written}");
        assert!(stack.join(output).exists());

        // Extract into a fresh directory and compare bytes.
        let extract_opts = ExtractOptions::parse(&strings(&[
            "--archive",
            output,
            "--destination",
            "restore",
            "--create-dirs",
        ]))
        .unwrap();
        extract_archive(&stack, &extract_opts, &broadcaster, &cancel).unwrap();

        let restored = stack.join("restore");
        assert_eq!(
            std::fs::read(restored.join("compose.yaml")).unwrap(),
            std::fs::read(stack.join("compose.yaml")).unwrap()
        );
        assert_eq!(
            std::fs::read(restored.join("data/sub/notes.txt")).unwrap(),
            b"notes"
        );
        // Excluded by *.log
        assert!(!restored.join("debug.log").exists());
        // The archive itself is never archived.
        assert!(!restored.join(output).exists());
    }

    #[test]
    fn tar_gz_roundtrip() {
        roundtrip(&["--format", "tar.gz"], "out.tgz");
    }

    #[test]
    fn tar_roundtrip() {
        roundtrip(&["--format", "tar"], "out.tar");
    }

    #[test]
    fn zip_roundtrip() {
        roundtrip(&["--format", "zip"], "out.zip");
    }

    #[test]
    fn traversal_entries_are_skipped_not_fatal() {
        let root = tempfile::tempdir().unwrap();
        let stack = root.path().join("stk");
        std::fs::create_dir_all(&stack).unwrap();

        // Build a tar containing an escaping entry by hand.
        let archive_path = stack.join("evil.tar");
        {
            let file = File::create(&archive_path).unwrap();
            let mut builder = tar::Builder::new(file);
            let mut header = tar::Header::new_gnu();
            header.set_size(5);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "../../escape.txt", &b"oops!"[..])
                .unwrap();
            let mut header = tar::Header::new_gnu();
            header.set_size(2);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "ok.txt", &b"ok"[..]).unwrap();
            builder.finish().unwrap();
        }

        let broadcaster = Arc::new(Broadcaster::new());
        let opts = ExtractOptions::parse(&strings(&[
            "--archive",
            "evil.tar",
            "--destination",
            "out",
            "--create-dirs",
        ]))
        .unwrap();
        let count =
            extract_archive(&stack, &opts, &broadcaster, &CancellationToken::new()).unwrap();

        assert_eq!(count, 1);
        assert!(stack.join("out/ok.txt").exists());
        assert!(!root.path().join("escape.txt").exists());
        let log = broadcaster.log_snapshot();
        assert!(log.iter().any(|message| matches!(
            message,
            OperationMessage::Stdout { data, .. } if data.contains("outside destination")
        )));
    }

    #[test]
    fn overwrite_false_preserves_existing_files() {
        let root = tempfile::tempdir().unwrap();
        let stack = root.path().join("stk");
        std::fs::create_dir_all(&stack).unwrap();
        std::fs::write(stack.join("keep.txt"), b"original").unwrap();

        let broadcaster = Arc::new(Broadcaster::new());
        let cancel = CancellationToken::new();

        let opts = CreateOptions::parse(&strings(&[
            "--format", "tar", "--output", "snap.tar", "--include", "keep.txt",
        ]))
        .unwrap();
        create_archive(&stack, &opts, &broadcaster, &cancel).unwrap();

        std::fs::write(stack.join("keep.txt"), b"modified").unwrap();

        let opts =
            ExtractOptions::parse(&strings(&["--archive", "snap.tar", "--destination", "."]))
                .unwrap();
        extract_archive(&stack, &opts, &broadcaster, &cancel).unwrap();
        assert_eq!(std::fs::read(stack.join("keep.txt")).unwrap(), b"modified");

        let opts = ExtractOptions::parse(&strings(&[
            "--archive",
            "snap.tar",
            "--destination",
            ".",
            "--overwrite",
        ]))
        .unwrap();
        extract_archive(&stack, &opts, &broadcaster, &cancel).unwrap();
        assert_eq!(std::fs::read(stack.join("keep.txt")).unwrap(), b"original");
    }

    #[test]
    fn missing_destination_without_create_dirs_errors() {
        let root = tempfile::tempdir().unwrap();
        let stack = root.path().join("stk");
        std::fs::create_dir_all(&stack).unwrap();
        std::fs::write(stack.join("a.txt"), b"a").unwrap();

        let broadcaster = Arc::new(Broadcaster::new());
        let cancel = CancellationToken::new();
        let opts = CreateOptions::parse(&strings(&["--output", "a.tar", "--include", "a.txt"]))
            .unwrap();
        create_archive(&stack, &opts, &broadcaster, &cancel).unwrap();

        let opts =
            ExtractOptions::parse(&strings(&["--archive", "a.tar", "--destination", "nowhere"]))
                .unwrap();
        let err = extract_archive(&stack, &opts, &broadcaster, &cancel).unwrap_err();
        assert!(matches!(err, ArchiveError::Io(_)));
    }
}

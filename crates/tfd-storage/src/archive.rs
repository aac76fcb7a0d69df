//! Tar packing and unpacking for servable version directories.

use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use tar::{Archive, Builder, EntryType, Header};

use crate::{Result, StorageError};

/// Packages the directory at `root` as a tar stream.
///
/// Entry names are `./relative` paths, directories included, in a stable
/// depth-first order.
pub fn pack_dir(root: &Path) -> Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());

    for entry in walk(root)? {
        let rel = entry
            .strip_prefix(root)
            .map_err(|_| StorageError::io("walk escaped root", invalid_input("bad prefix")))?;
        let name = format!("./{}", rel.display());

        let metadata = fs::metadata(&entry)
            .map_err(|e| StorageError::io(format!("stat {}", entry.display()), e))?;
        if metadata.is_dir() {
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o755);
            header.set_cksum();
            builder
                .append_data(&mut header, &name, std::io::empty())
                .map_err(|e| StorageError::io(format!("append dir {name}"), e))?;
        } else {
            let mut file = fs::File::open(&entry)
                .map_err(|e| StorageError::io(format!("open {}", entry.display()), e))?;
            let mut header = Header::new_gnu();
            header.set_size(metadata.len());
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, &name, &mut file)
                .map_err(|e| StorageError::io(format!("append file {name}"), e))?;
        }
    }

    builder
        .into_inner()
        .map_err(|e| StorageError::io("finish archive", e))
}

/// Unpacks the tar archive at `archive_path` into its parent directory.
///
/// Only regular files are materialised; parent directories are created as
/// needed with `dir_perm` and files with `file_perm`. Entries that would
/// escape the destination are rejected.
pub fn unpack_next_to(archive_path: &Path, dir_perm: u32, file_perm: u32) -> Result<()> {
    let dest = archive_path
        .parent()
        .ok_or_else(|| StorageError::io("archive has no parent", invalid_input("bad path")))?;

    let file = fs::File::open(archive_path)
        .map_err(|e| StorageError::io(format!("open {}", archive_path.display()), e))?;
    let mut archive = Archive::new(file);

    let entries = archive
        .entries()
        .map_err(|e| StorageError::io("read archive entries", e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| StorageError::io("read archive entry", e))?;
        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }

        let rel = entry
            .path()
            .map_err(|e| StorageError::io("decode entry path", e))?
            .into_owned();
        let target = safe_join(dest, &rel)?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StorageError::io(format!("mkdir {}", parent.display()), e))?;
            set_mode(parent, dir_perm);
        }

        let mut contents = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
        entry
            .read_to_end(&mut contents)
            .map_err(|e| StorageError::io("read entry contents", e))?;
        fs::write(&target, contents)
            .map_err(|e| StorageError::io(format!("write {}", target.display()), e))?;
        set_mode(&target, file_perm);
    }

    Ok(())
}

/// Joins an archive entry path onto `dest`, rejecting traversal.
fn safe_join(dest: &Path, rel: &Path) -> Result<PathBuf> {
    let mut target = dest.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => target.push(part),
            Component::CurDir => {}
            _ => {
                return Err(StorageError::io(
                    format!("archive entry escapes destination: {}", rel.display()),
                    invalid_input("path traversal"),
                ));
            }
        }
    }
    Ok(target)
}

/// Walks every entry below `root` depth-first, directories before their
/// contents, names sorted for determinism. `root` itself is excluded.
pub fn walk(root: &Path) -> Result<Vec<PathBuf>> {
    let mut collected = Vec::new();
    walk_into(root, &mut collected)?;
    Ok(collected)
}

fn walk_into(dir: &Path, collected: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| StorageError::io(format!("read dir {}", dir.display()), e))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()
        .map_err(|e| StorageError::io(format!("read dir {}", dir.display()), e))?;
    entries.sort();

    for path in entries {
        let is_dir = path.is_dir();
        collected.push(path.clone());
        if is_dir {
            walk_into(&path, collected)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
pub(crate) fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
}

#[cfg(not(unix))]
pub(crate) fn set_mode(_path: &Path, _mode: u32) {}

fn invalid_input(message: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, message.to_string())
}

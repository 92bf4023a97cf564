use std::fs::OpenOptions;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use log::{debug, info, warn};
use tar::EntryType;

use crate::error::ExtractError;

use super::{Compression, PEEK_SIZE};

/// setuid, setgid and sticky bits are never honored from an archive.
const MODE_SPECIAL_BITS: u32 = 0o7000;
const PARENT_DIR_MODE: u32 = 0o755;

struct DeferredLink {
    hard: bool,
    old_name: PathBuf,
    new_name: PathBuf,
}

/// Unpacks a (possibly compressed) tar stream under `dest_dir`.
///
/// Regular files and directories are materialized as they arrive; links are
/// queued and created after the stream ends, so hardlink targets exist by
/// the time they are referenced. After the archive's end marker the rest of
/// the stream must be null padding, which doubles as a byte-count check on
/// the transport.
pub fn extract_tar<R: Read>(
    reader: R,
    dest_dir: &Path,
    overwrite: bool,
) -> Result<(), ExtractError> {
    let dest_dir = std::path::absolute(dest_dir)?;
    let mut links: Vec<DeferredLink> = Vec::new();

    let (peeked, reader) = peek(reader)?;
    let compression = Compression::detect(&peeked);
    if compression != Compression::Plain {
        info!(
            "detected {compression:?} compression; streaming decompression enabled \
             (this can significantly slow down extraction)"
        );
    }
    let decoder = compression.decoder(io::Cursor::new(peeked).chain(reader))?;

    let mut archive = tar::Archive::new(decoder);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path_bytes().is_empty() {
            return Err(ExtractError::EmptyName);
        }
        let name = entry.path()?.into_owned();
        let target = safe_join(&dest_dir, &name)?;
        make_parent_dirs(&target)?;

        let kind = entry.header().entry_type();
        let mode = clean_mode(entry.header().mode()?);
        match kind {
            EntryType::XGlobalHeader => {
                // Global pax headers do not persist across entries here;
                // concatenated archives relying on them are unsupported.
                warn!("skipping global pax header entry {}", name.display());
            }
            EntryType::XHeader => {
                debug!("skipping pax extension header entry");
            }
            EntryType::Directory => {
                debug!("dir {} mode {mode:o}", target.display());
                make_dir(&target, mode)?;
            }
            EntryType::Regular => {
                debug!("file {} mode {mode:o}", target.display());
                let mut open = OpenOptions::new();
                open.create(true).write(true).truncate(overwrite);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::OpenOptionsExt;
                    open.mode(mode);
                }
                let mut file = open.open(&target)?;
                io::copy(&mut entry, &mut file)?;
            }
            EntryType::Symlink | EntryType::Link => {
                let old_name = match entry.link_name()? {
                    Some(old) => old.into_owned(),
                    None => return Err(ExtractError::EmptyName),
                };
                debug!(
                    "deferring link {} -> {}",
                    target.display(),
                    old_name.display()
                );
                links.push(DeferredLink {
                    hard: kind == EntryType::Link,
                    old_name,
                    new_name: target,
                });
            }
            other => {
                return Err(ExtractError::UnsupportedEntry {
                    name: name.display().to_string(),
                    type_flag: other.as_byte(),
                });
            }
        }
    }

    create_links(links, &dest_dir, overwrite)?;

    // Everything after the end-of-archive marker must be null padding.
    let mut rest = archive.into_inner();
    let mut padding = Vec::new();
    rest.read_to_end(&mut padding)?;
    if let Some(&byte) = padding.iter().find(|&&b| b != 0x00) {
        return Err(ExtractError::Padding { byte });
    }

    Ok(())
}

fn create_links(
    links: Vec<DeferredLink>,
    dest_dir: &Path,
    overwrite: bool,
) -> Result<(), ExtractError> {
    for link in links {
        make_parent_dirs(&link.new_name)?;
        if overwrite {
            match std::fs::remove_file(&link.new_name) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        if link.hard {
            // Hardlink targets are paths inside the archive.
            let old_path = join_under(dest_dir, &link.old_name);
            debug!(
                "hardlink {} -> {}",
                link.new_name.display(),
                old_path.display()
            );
            std::fs::hard_link(old_path, &link.new_name)?;
        } else {
            // Symlink targets are kept verbatim.
            debug!(
                "symlink {} -> {}",
                link.new_name.display(),
                link.old_name.display()
            );
            make_symlink(&link.old_name, &link.new_name)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn make_symlink(old_name: &Path, new_name: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(old_name, new_name)
}

#[cfg(not(unix))]
fn make_symlink(_old_name: &Path, new_name: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("symlinks are not supported here: {}", new_name.display()),
    ))
}

/// Joins an archive entry name under the destination, resolving `.` and
/// `..` lexically and rejecting any name that would climb out.
fn safe_join(dest_dir: &Path, name: &Path) -> Result<PathBuf, ExtractError> {
    let mut target = dest_dir.to_path_buf();
    let mut depth = 0usize;
    for component in name.components() {
        match component {
            Component::Normal(part) => {
                target.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            // Leading roots are treated as relative to the destination.
            Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(ExtractError::ZipSlip {
                        name: name.display().to_string(),
                    });
                }
                target.pop();
                depth -= 1;
            }
        }
    }
    Ok(target)
}

/// Lexical clean-join for hardlink targets, mirroring how the entry names
/// themselves are anchored.
fn join_under(dest_dir: &Path, path: &Path) -> PathBuf {
    let mut out = dest_dir.to_path_buf();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            _ => {}
        }
    }
    out
}

fn make_parent_dirs(target: &Path) -> io::Result<()> {
    match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => make_dir(parent, PARENT_DIR_MODE),
        _ => Ok(()),
    }
}

fn make_dir(path: &Path, mode: u32) -> io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    builder.create(path)
}

fn clean_mode(mode: u32) -> u32 {
    mode & !MODE_SPECIAL_BITS
}

fn peek<R: Read>(mut reader: R) -> io::Result<(Vec<u8>, R)> {
    let mut peeked = vec![0u8; PEEK_SIZE];
    let mut filled = 0usize;
    while filled < peeked.len() {
        let n = reader.read(&mut peeked[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    peeked.truncate(filled);
    Ok((peeked, reader))
}

//! Recycle area - the reversible destination for merged-away files.
//!
//! Losers move to the platform trash when available and enabled,
//! otherwise to an app-owned `recycle/<tx_id>/` directory. Every move
//! records its destination in the transaction, collision-suffixed with
//! `-<tx_id>-<n>`, so undo can restore the exact original paths without
//! ever overwriting an unrelated file.

use crate::{DvojnikError, Result, TxId};
use std::fs;
use std::path::{Path, PathBuf};

/// EXDEV: rename across filesystems; fall back to copy + remove.
const EXDEV: i32 = 18;

/// Attempts before a collision is declared unresolvable.
const MAX_COLLISION_ATTEMPTS: u32 = 1000;

/// Resolves recycle destinations for one engine instance.
#[derive(Debug, Clone)]
pub struct RecycleArea {
    app_recycle: PathBuf,
    trash_dir: Option<PathBuf>,
}

impl RecycleArea {
    /// `data_dir` owns the fallback `recycle/` directory. The platform
    /// trash is probed once; `move_to_trash = false` disables it.
    pub fn new(data_dir: &Path, move_to_trash: bool) -> RecycleArea {
        let trash_dir = if move_to_trash {
            platform_trash_dir()
        } else {
            None
        };
        RecycleArea {
            app_recycle: data_dir.join("recycle"),
            trash_dir,
        }
    }

    /// Directory receiving this transaction's losers, without touching
    /// the filesystem (dry runs plan against it).
    pub fn dir_path(&self, tx_id: TxId) -> PathBuf {
        match &self.trash_dir {
            Some(trash) => trash.join(format!("dvojnik-{}", tx_id)),
            None => self.app_recycle.join(tx_id.to_string()),
        }
    }

    /// Directory receiving this transaction's losers; created on demand.
    pub fn dir_for(&self, tx_id: TxId) -> Result<PathBuf> {
        let dir = self.dir_path(tx_id);
        fs::create_dir_all(&dir)
            .map_err(|e| DvojnikError::from_io_with_path(Some(dir.clone()), e))?;
        Ok(dir)
    }

    /// Moves `src` into the transaction's recycle directory and returns
    /// the destination path actually used.
    pub fn move_to_recycle(&self, src: &Path, recycle_dir: &Path, tx_id: TxId) -> Result<PathBuf> {
        let name = src
            .file_name()
            .ok_or_else(|| DvojnikError::Internal {
                message: format!("recycle source has no file name: {}", src.display()),
            })?
            .to_string_lossy()
            .to_string();
        let dest = collision_free(recycle_dir, &name, tx_id)?;
        move_file(src, &dest)?;
        Ok(dest)
    }

    /// Restores a recycled file to its original path.
    ///
    /// Never overwrites: if something else now occupies the original
    /// path, the restore lands on a `-<tx_id>-<n>` suffixed sibling and
    /// that path is returned.
    pub fn restore(&self, recycle_path: &Path, original: &Path, tx_id: TxId) -> Result<PathBuf> {
        if !recycle_path.exists() {
            // Trash emptied out of band.
            return Err(DvojnikError::NotFound {
                path: recycle_path.display().to_string(),
            });
        }
        let dest = if original.exists() {
            let name = original
                .file_name()
                .ok_or_else(|| DvojnikError::Internal {
                    message: format!("restore target has no file name: {}", original.display()),
                })?
                .to_string_lossy()
                .to_string();
            let parent = original.parent().unwrap_or_else(|| Path::new("."));
            collision_free(parent, &name, tx_id)?
        } else {
            if let Some(parent) = original.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| DvojnikError::from_io_with_path(Some(parent.to_path_buf()), e))?;
            }
            original.to_path_buf()
        };
        move_file(recycle_path, &dest)?;
        Ok(dest)
    }
}

/// First non-existing path in `dir` for `name`, suffixing the stem with
/// `-<tx_id>-<n>` on collision.
fn collision_free(dir: &Path, name: &str, tx_id: TxId) -> Result<PathBuf> {
    let plain = dir.join(name);
    if !plain.exists() {
        return Ok(plain);
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), Some(ext.to_string())),
        _ => (name.to_string(), None),
    };
    for n in 1..=MAX_COLLISION_ATTEMPTS {
        let candidate_name = match &ext {
            Some(ext) => format!("{}-{}-{}.{}", stem, tx_id, n, ext),
            None => format!("{}-{}-{}", stem, tx_id, n),
        };
        let candidate = dir.join(candidate_name);
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(DvojnikError::CollisionUnresolvable {
        path: plain.display().to_string(),
    })
}

/// Rename, with a copy + remove fallback when crossing filesystems.
pub(crate) fn move_file(src: &Path, dest: &Path) -> Result<()> {
    match fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(EXDEV) => {
            fs::copy(src, dest)
                .map_err(|e| DvojnikError::from_io_with_path(Some(dest.to_path_buf()), e))?;
            fs::remove_file(src)
                .map_err(|e| DvojnikError::from_io_with_path(Some(src.to_path_buf()), e))?;
            Ok(())
        }
        Err(e) => Err(DvojnikError::from_io_with_path(Some(src.to_path_buf()), e)),
    }
}

/// Platform trash directory, when one exists.
#[cfg(target_os = "macos")]
fn platform_trash_dir() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    let trash = PathBuf::from(home).join(".Trash");
    trash.is_dir().then_some(trash)
}

/// Platform trash directory, when one exists (XDG layout).
#[cfg(all(unix, not(target_os = "macos")))]
fn platform_trash_dir() -> Option<PathBuf> {
    let data_home = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))?;
    let trash = data_home.join("Trash/files");
    trash.is_dir().then_some(trash)
}

/// No portable trash location on this platform.
#[cfg(not(unix))]
fn platform_trash_dir() -> Option<PathBuf> {
    None
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn area(dir: &TempDir) -> RecycleArea {
        // move_to_trash = false keeps tests inside the temp dir.
        RecycleArea::new(dir.path(), false)
    }

    #[test]
    fn test_move_and_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("photo.jpg");
        fs::write(&src, b"payload").unwrap();

        let area = area(&dir);
        let tx = TxId(7);
        let recycle_dir = area.dir_for(tx).unwrap();
        let recycled = area.move_to_recycle(&src, &recycle_dir, tx).unwrap();

        assert!(!src.exists());
        assert!(recycled.exists());
        assert!(recycled.starts_with(dir.path().join("recycle")));

        let restored = area.restore(&recycled, &src, tx).unwrap();
        assert_eq!(restored, src);
        assert_eq!(fs::read(&src).unwrap(), b"payload");
    }

    #[test]
    fn test_recycle_collision_gets_suffix() {
        let dir = TempDir::new().unwrap();
        let area = area(&dir);
        let tx = TxId(9);
        let recycle_dir = area.dir_for(tx).unwrap();

        for content in [b"one" as &[u8], b"two"] {
            let src = dir.path().join("same.jpg");
            fs::write(&src, content).unwrap();
            area.move_to_recycle(&src, &recycle_dir, tx).unwrap();
        }

        let mut names: Vec<String> = fs::read_dir(&recycle_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);
        assert_eq!(names[0], "same.jpg");
        assert_eq!(names[1], format!("same-{}-1.jpg", tx));
    }

    #[test]
    fn test_restore_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let area = area(&dir);
        let tx = TxId(11);
        let recycle_dir = area.dir_for(tx).unwrap();

        let src = dir.path().join("keep.jpg");
        fs::write(&src, b"original").unwrap();
        let recycled = area.move_to_recycle(&src, &recycle_dir, tx).unwrap();

        // Something unrelated took the original path meanwhile.
        fs::write(&src, b"newcomer").unwrap();

        let restored = area.restore(&recycled, &src, tx).unwrap();
        assert_ne!(restored, src);
        assert_eq!(fs::read(&src).unwrap(), b"newcomer");
        assert_eq!(fs::read(&restored).unwrap(), b"original");
    }

    #[test]
    fn test_restore_missing_payload_is_not_found() {
        let dir = TempDir::new().unwrap();
        let area = area(&dir);
        let gone = dir.path().join("recycle/00/gone.jpg");
        let err = area
            .restore(&gone, &dir.path().join("back.jpg"), TxId(1))
            .unwrap_err();
        assert!(matches!(err, DvojnikError::NotFound { .. }));
    }

    #[test]
    fn test_collision_free_without_extension() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("README"), b"x").unwrap();
        let tx = TxId(3);
        let path = collision_free(dir.path(), "README", tx).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            format!("README-{}-1", tx)
        );
    }
}

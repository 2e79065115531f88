use crate::error::{Error, Result};
use std::env::{current_dir, set_current_dir};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

/// Root-only helper executable; the single privileged edge of the program.
const HELPER: &str = "mod-manager-overlayfs-helper";
const ELEVATE: &str = "pkexec";

/// Time the kernel gets to finalize an unmounted filesystem.
const SETTLE: Duration = Duration::from_secs(2);

/// On-disk state of a game directory pair, recomputed from the filesystem on
/// every call. Invalid combinations surface as `Error::StateInvalid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    /// Files are in the original path, the moved-aside path is absent or empty.
    Normal,
    /// The overlay is mounted at the original path, files are moved aside.
    Mounted,
    /// The original path is gone and the files sit in the moved-aside path.
    Moved,
}

pub struct Overlay {
    game_id: String,
    path: PathBuf,
    moved_path: PathBuf,
}

impl Overlay {
    pub fn new(game_id: String, path: PathBuf, moved_path: PathBuf) -> Self {
        Overlay {
            game_id,
            path,
            moved_path,
        }
    }

    /// Classify the current mount state. Side-effect free except for one
    /// documented cleanup: an empty, unmounted original directory next to a
    /// populated moved-aside directory is removed (leftover of an
    /// interrupted activation).
    pub fn classify(&self) -> Result<MountState> {
        if !self.path.is_dir() {
            if !self.moved_path.is_dir() {
                return Err(self.invalid(format!(
                    "'{}' and '{}' are both absent",
                    self.path.display(),
                    self.moved_path.display()
                )));
            }
            if self.dir_is_empty(&self.moved_path)? {
                return Err(self.invalid(format!(
                    "'{}' is absent and '{}' is empty",
                    self.path.display(),
                    self.moved_path.display()
                )));
            }
            return Ok(MountState::Moved);
        }

        if is_mountpoint(&self.path)? {
            if !self.moved_path.is_dir() {
                return Err(self.invalid(format!(
                    "'{}' is mounted but '{}' is absent",
                    self.path.display(),
                    self.moved_path.display()
                )));
            }
            if self.dir_is_empty(&self.moved_path)? {
                return Err(self.invalid(format!(
                    "'{}' is mounted but '{}' is empty",
                    self.path.display(),
                    self.moved_path.display()
                )));
            }
            return Ok(MountState::Mounted);
        }

        if self.dir_is_empty(&self.path)? {
            if !self.moved_path.is_dir() {
                return Err(self.invalid(format!(
                    "'{}' is empty and '{}' is absent",
                    self.path.display(),
                    self.moved_path.display()
                )));
            }
            if self.dir_is_empty(&self.moved_path)? {
                return Err(self.invalid(format!(
                    "'{}' and '{}' are both empty",
                    self.path.display(),
                    self.moved_path.display()
                )));
            }
            fs::remove_dir(&self.path).map_err(|err| {
                Error::file(
                    format!("remove leftover empty directory '{}'", self.path.display()),
                    err,
                )
            })?;
            return Ok(MountState::Moved);
        }

        if self.moved_path.is_dir() && !self.dir_is_empty(&self.moved_path)? {
            return Err(self.invalid(format!(
                "'{}' and '{}' are both non-empty",
                self.path.display(),
                self.moved_path.display()
            )));
        }

        Ok(MountState::Normal)
    }

    /// Mount the overlay at the original path. The working directory moves
    /// to `/` around the helper call so this process does not hold the
    /// mountpoint open itself.
    pub fn mount(&self, options: &str) -> Result<()> {
        let restore = self.leave_mountpoint()?;

        let status = Command::new(ELEVATE)
            .arg(HELPER)
            .arg("mount")
            .arg(&self.game_id)
            .arg(options)
            .arg(&self.path)
            .status();
        restore_cwd(restore);

        match status {
            Ok(status) if status.success() => {}
            Ok(status) => {
                return Err(self.invalid(format!("'mount' helper exited with {status}")));
            }
            Err(err) => {
                return Err(Error::file(
                    format!("run '{ELEVATE} {HELPER} mount' for game '{}'", self.game_id),
                    err,
                ));
            }
        }

        if !is_mountpoint(&self.path)? {
            return Err(self.invalid(format!(
                "'{}' is not a mountpoint after mounting",
                self.path.display()
            )));
        }

        Ok(())
    }

    /// Unmount the overlay. Fails with `Error::Busy` when live processes
    /// still hold files open below the mountpoint.
    pub fn unmount(&self) -> Result<()> {
        let restore = self.leave_mountpoint()?;

        // lsof exits zero when it found open files below the path
        match Command::new("lsof").arg("+f").arg("--").arg(&self.path).status() {
            Ok(status) if status.success() => {
                restore_cwd(restore);
                return Err(Error::Busy {
                    game: self.game_id.clone(),
                });
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(
                    "could not check for processes using '{}': {err}",
                    self.path.display()
                );
            }
        }

        let status = Command::new(ELEVATE)
            .arg(HELPER)
            .arg("umount")
            .arg(&self.game_id)
            .status();

        let result = match status {
            Ok(status) if status.success() => {
                thread::sleep(SETTLE);
                Ok(())
            }
            Ok(status) => Err(self.invalid(format!("'umount' helper exited with {status}"))),
            Err(err) => Err(Error::file(
                format!(
                    "run '{ELEVATE} {HELPER} umount' for game '{}'",
                    self.game_id
                ),
                err,
            )),
        };

        restore_cwd(restore);
        result
    }

    /// Have the helper clear `index/` and `work/` from a previous mount.
    /// The helper enforces its own preconditions (not mounted, directory
    /// named `workdir` under this game's cache directory).
    pub fn clean_workdir(&self, workdir: &Path) -> Result<()> {
        let status = Command::new(ELEVATE)
            .arg(HELPER)
            .arg("cleanworkdir")
            .arg(&self.game_id)
            .arg(workdir)
            .status();

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(self.invalid(format!("'cleanworkdir' helper exited with {status}"))),
            Err(err) => Err(Error::file(
                format!(
                    "run '{ELEVATE} {HELPER} cleanworkdir' for game '{}'",
                    self.game_id
                ),
                err,
            )),
        }
    }

    fn leave_mountpoint(&self) -> Result<Option<PathBuf>> {
        let previous = current_dir().ok();
        set_current_dir("/").map_err(|err| Error::file("change working directory to '/'", err))?;
        Ok(previous)
    }

    fn dir_is_empty(&self, path: &Path) -> Result<bool> {
        let mut entries = fs::read_dir(path)
            .map_err(|err| Error::file(format!("read directory '{}'", path.display()), err))?;
        Ok(entries.next().is_none())
    }

    fn invalid(&self, message: String) -> Error {
        Error::StateInvalid {
            game: self.game_id.clone(),
            message,
        }
    }
}

fn restore_cwd(previous: Option<PathBuf>) {
    if let Some(previous) = previous {
        if let Err(err) = set_current_dir(&previous) {
            tracing::warn!(
                "could not return to working directory '{}': {err}",
                previous.display()
            );
        }
    }
}

/// True when a filesystem is currently mounted exactly at `path`, read from
/// the kernel's mount table.
pub fn is_mountpoint(path: &Path) -> Result<bool> {
    let target = match path.canonicalize() {
        Ok(target) => target,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => {
            return Err(Error::file(
                format!("canonicalize '{}'", path.display()),
                err,
            ));
        }
    };

    let table = fs::read_to_string("/proc/self/mounts")
        .map_err(|err| Error::file("read /proc/self/mounts", err))?;

    for line in table.lines() {
        let mut fields = line.split_whitespace();
        let Some(mount_point) = fields.nth(1) else {
            continue;
        };
        if Path::new(&unescape_mount_path(mount_point)) == target {
            return Ok(true);
        }
    }

    Ok(false)
}

/// The mount table escapes whitespace and backslashes as three-digit octal.
fn unescape_mount_path(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        let digits: String = chars.clone().take(3).collect();
        if digits.len() == 3 {
            if let Ok(code) = u8::from_str_radix(&digits, 8) {
                out.push(code as char);
                chars.nth(2);
                continue;
            }
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn overlay(path: &Path, moved: &Path) -> Overlay {
        Overlay::new(
            "test_game".to_string(),
            path.to_path_buf(),
            moved.to_path_buf(),
        )
    }

    fn touch(dir: &Path) {
        fs::write(dir.join("file"), "data").unwrap();
    }

    #[test]
    fn both_absent_is_invalid() {
        let root = TempDir::new().unwrap();
        let result = overlay(&root.path().join("game"), &root.path().join("moved")).classify();
        assert!(matches!(result, Err(Error::StateInvalid { .. })));
    }

    #[test]
    fn populated_original_alone_is_normal() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("game");
        fs::create_dir(&path).unwrap();
        touch(&path);
        let state = overlay(&path, &root.path().join("moved")).classify().unwrap();
        assert_eq!(state, MountState::Normal);
    }

    #[test]
    fn empty_moved_path_still_counts_as_normal() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("game");
        let moved = root.path().join("moved");
        fs::create_dir(&path).unwrap();
        touch(&path);
        fs::create_dir(&moved).unwrap();
        assert_eq!(overlay(&path, &moved).classify().unwrap(), MountState::Normal);
    }

    #[test]
    fn absent_original_with_populated_moved_is_moved() {
        let root = TempDir::new().unwrap();
        let moved = root.path().join("moved");
        fs::create_dir(&moved).unwrap();
        touch(&moved);
        let state = overlay(&root.path().join("game"), &moved).classify().unwrap();
        assert_eq!(state, MountState::Moved);
    }

    #[test]
    fn empty_original_is_cleaned_up_and_moved() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("game");
        let moved = root.path().join("moved");
        fs::create_dir(&path).unwrap();
        fs::create_dir(&moved).unwrap();
        touch(&moved);
        assert_eq!(overlay(&path, &moved).classify().unwrap(), MountState::Moved);
        assert!(!path.exists());
    }

    #[test]
    fn two_populated_directories_are_invalid() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("game");
        let moved = root.path().join("moved");
        fs::create_dir(&path).unwrap();
        touch(&path);
        fs::create_dir(&moved).unwrap();
        touch(&moved);
        assert!(matches!(
            overlay(&path, &moved).classify(),
            Err(Error::StateInvalid { .. })
        ));
    }

    #[test]
    fn both_empty_is_invalid() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("game");
        let moved = root.path().join("moved");
        fs::create_dir(&path).unwrap();
        fs::create_dir(&moved).unwrap();
        assert!(matches!(
            overlay(&path, &moved).classify(),
            Err(Error::StateInvalid { .. })
        ));
    }

    #[test]
    fn plain_directory_is_not_a_mountpoint() {
        let root = TempDir::new().unwrap();
        assert!(!is_mountpoint(root.path()).unwrap());
    }

    #[test]
    fn missing_path_is_not_a_mountpoint() {
        let root = TempDir::new().unwrap();
        assert!(!is_mountpoint(&root.path().join("gone")).unwrap());
    }

    #[test]
    fn root_is_a_mountpoint() {
        assert!(is_mountpoint(Path::new("/")).unwrap());
    }

    #[test]
    fn mount_table_octal_escapes_are_decoded() {
        assert_eq!(unescape_mount_path(r"/mnt/my\040drive"), "/mnt/my drive");
        assert_eq!(unescape_mount_path(r"/mnt/tab\011here"), "/mnt/tab\there");
        assert_eq!(unescape_mount_path(r"/mnt/back\134slash"), r"/mnt/back\slash");
        assert_eq!(unescape_mount_path("/plain"), "/plain");
    }
}

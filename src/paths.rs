use directories::BaseDirs;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Program name, also used as the suffix of the moved-aside game directory
/// and as the per-user directory prefix.
pub const APP_NAME: &str = "mod-manager";

/// User base directories with the program prefix applied, captured once at
/// startup.
#[derive(Debug, Clone)]
pub struct Dirs {
    config_root: PathBuf,
    data_root: PathBuf,
    cache_root: PathBuf,
    runtime_root: Option<PathBuf>,
}

impl Dirs {
    pub fn from_env() -> Option<Self> {
        let base = BaseDirs::new()?;
        Some(Dirs {
            config_root: base.config_dir().join(APP_NAME),
            data_root: base.data_dir().join(APP_NAME),
            cache_root: base.cache_dir().join(APP_NAME),
            runtime_root: base.runtime_dir().map(|dir| dir.join(APP_NAME)),
        })
    }

    pub fn from_roots(
        config_root: PathBuf,
        data_root: PathBuf,
        cache_root: PathBuf,
        runtime_root: Option<PathBuf>,
    ) -> Self {
        Dirs {
            config_root,
            data_root,
            cache_root,
            runtime_root,
        }
    }

    pub fn config_root(&self) -> &Path {
        &self.config_root
    }

    pub fn main_config_file(&self) -> PathBuf {
        self.config_root.join("config.toml")
    }

    pub fn config_file(&self, game_id: &str) -> PathBuf {
        self.config_root.join(format!("{game_id}.toml"))
    }

    pub fn game_paths(&self, game_id: &str) -> GamePaths {
        GamePaths {
            mod_root: self.data_root.join(game_id),
            cache_dir: self.cache_root.join(game_id),
            runtime_dir: self
                .runtime_root
                .as_ref()
                .map(|root| root.join(game_id)),
        }
    }
}

/// Derived per-game paths. `mod_root` is the default used when the config
/// does not name one.
#[derive(Debug, Clone)]
pub struct GamePaths {
    pub mod_root: PathBuf,
    pub cache_dir: PathBuf,
    pub runtime_dir: Option<PathBuf>,
}

impl GamePaths {
    /// Overlay upper directory for a mount with write access.
    pub fn upper_dir(&self, active_set: Option<&str>, is_setup: bool) -> PathBuf {
        let name = if is_setup {
            "persistent_setup".to_string()
        } else {
            match active_set {
                Some(set) => format!("{set}_persistent"),
                None => "persistent_modless".to_string(),
            }
        };
        self.cache_dir.join(name)
    }

    pub fn workdir(&self) -> PathBuf {
        self.cache_dir.join("workdir")
    }

    /// Empty directory used as a second lower layer when mounting without
    /// any mod set; the overlay needs at least two lower directories.
    pub fn dummy_dir(&self) -> PathBuf {
        self.cache_dir.join(format!("{APP_NAME}_empty_dummy"))
    }
}

/// Sibling path the original game directory is renamed to while the overlay
/// occupies its place.
pub fn moved_path_for(path: &Path) -> PathBuf {
    let mut moved = OsString::from(path.as_os_str());
    moved.push(format!("_{APP_NAME}"));
    PathBuf::from(moved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dirs() -> Dirs {
        Dirs::from_roots(
            PathBuf::from("/c/mod-manager"),
            PathBuf::from("/d/mod-manager"),
            PathBuf::from("/k/mod-manager"),
            Some(PathBuf::from("/r/mod-manager")),
        )
    }

    #[test]
    fn moved_path_appends_suffix() {
        assert_eq!(
            moved_path_for(Path::new("/games/skyrim")),
            PathBuf::from("/games/skyrim_mod-manager")
        );
    }

    #[test]
    fn per_game_layout() {
        let paths = test_dirs().game_paths("skyrim");
        assert_eq!(paths.mod_root, PathBuf::from("/d/mod-manager/skyrim"));
        assert_eq!(paths.cache_dir, PathBuf::from("/k/mod-manager/skyrim"));
        assert_eq!(
            paths.runtime_dir,
            Some(PathBuf::from("/r/mod-manager/skyrim"))
        );
        assert_eq!(
            paths.dummy_dir(),
            PathBuf::from("/k/mod-manager/skyrim/mod-manager_empty_dummy")
        );
        assert_eq!(
            paths.workdir(),
            PathBuf::from("/k/mod-manager/skyrim/workdir")
        );
    }

    #[test]
    fn upper_dir_naming() {
        let paths = test_dirs().game_paths("skyrim");
        assert_eq!(
            paths.upper_dir(Some("vanilla_plus"), false),
            PathBuf::from("/k/mod-manager/skyrim/vanilla_plus_persistent")
        );
        assert_eq!(
            paths.upper_dir(None, false),
            PathBuf::from("/k/mod-manager/skyrim/persistent_modless")
        );
        assert_eq!(
            paths.upper_dir(Some("vanilla_plus"), true),
            PathBuf::from("/k/mod-manager/skyrim/persistent_setup")
        );
    }

    #[test]
    fn config_file_layout() {
        let dirs = test_dirs();
        assert_eq!(
            dirs.config_file("skyrim"),
            PathBuf::from("/c/mod-manager/skyrim.toml")
        );
        assert_eq!(
            dirs.main_config_file(),
            PathBuf::from("/c/mod-manager/config.toml")
        );
    }
}

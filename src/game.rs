use crate::command::ExternalCommand;
use crate::config::{CommandSpec, GameConfig, MainConfig};
use crate::error::{Error, Result};
use crate::mod_set::ModSet;
use crate::overlay::{MountState, Overlay};
use crate::paths::{moved_path_for, Dirs, GamePaths};
use rustix::process::{kill_process, Pid, Signal};
use std::fs;
use std::io::{self, stdin, ErrorKind};
use std::path::{Path, PathBuf};
use std::process::Child;
use std::thread;
use std::time::Duration;
use walkdir::WalkDir;

/// Time child processes and the kernel get to settle after wrapped
/// execution and before restoring the original layout.
const SETTLE: Duration = Duration::from_secs(2);

pub struct Game {
    pub id: String,
    path: PathBuf,
    moved_path: PathBuf,
    mod_root: PathBuf,
    paths: GamePaths,
    overlay: Overlay,
    writable: bool,
    run_pre_commands: bool,
    active_set: Option<String>,
    mod_tree: Option<ModSet>,
    pre_command_specs: Vec<CommandSpec>,
}

impl Game {
    pub fn from_config_file(
        dirs: &Dirs,
        id: &str,
        set_override: Option<String>,
        main: &MainConfig,
    ) -> Result<Self> {
        let config = GameConfig::load(&dirs.config_file(id), id)?;
        Game::from_config(dirs, id, set_override, config, main)
    }

    pub fn from_config(
        dirs: &Dirs,
        id: &str,
        set_override: Option<String>,
        config: GameConfig,
        main: &MainConfig,
    ) -> Result<Self> {
        let paths = dirs.game_paths(id);

        let path = match &config.path {
            Some(path) => path.clone(),
            None => match &main.default.game_root_path {
                Some(root) => root.join(id),
                None => {
                    return Err(Error::KeyMissing {
                        game: id.to_string(),
                        key: "path".to_string(),
                    });
                }
            },
        };
        let moved_path = moved_path_for(&path);

        let mod_root = match &config.mod_root_path {
            Some(root) => root.clone(),
            None => match &main.default.mod_root_path {
                Some(root) => root.join(id),
                None => paths.mod_root.clone(),
            },
        };
        fs::create_dir_all(&mod_root).map_err(|err| {
            Error::file(format!("create mod root '{}'", mod_root.display()), err)
        })?;

        let active_set = match set_override {
            Some(set) if set.is_empty() => None,
            Some(set) => Some(set),
            None => config.active.clone().filter(|set| !set.is_empty()),
        };

        let mod_tree = match &active_set {
            Some(set) => Some(ModSet::resolve(set, &config, id, &mod_root)?),
            None => None,
        };

        let overlay = Overlay::new(id.to_string(), path.clone(), moved_path.clone());

        Ok(Game {
            id: id.to_string(),
            path,
            moved_path,
            mod_root,
            paths,
            overlay,
            writable: config.writable,
            run_pre_commands: config.run_pre_command,
            active_set,
            mod_tree,
            pre_command_specs: config.pre_command,
        })
    }

    /// Swap the game directory for the overlay mount. Re-mounts when already
    /// mounted (the set may have changed) and recovers a moved-aside layout
    /// left behind by an interrupted run.
    pub fn activate(&self, writable: bool, is_setup: bool) -> Result<()> {
        if self.overlay.classify()? == MountState::Mounted {
            self.deactivate()?;
        }

        if self.overlay.classify()? == MountState::Normal {
            fs::rename(&self.path, &self.moved_path).map_err(|err| {
                Error::file(
                    format!(
                        "move game directory '{}' to '{}'",
                        self.path.display(),
                        self.moved_path.display()
                    ),
                    err,
                )
            })?;
        }

        if self.overlay.classify()? != MountState::Moved {
            return Err(Error::StateInvalid {
                game: self.id.clone(),
                message: "unexpected state right before mounting".to_string(),
            });
        }

        fs::create_dir_all(&self.path).map_err(|err| {
            Error::file(
                format!("create mount target '{}'", self.path.display()),
                err,
            )
        })?;

        let writable = self.is_writable(writable, is_setup);
        let options = self.mount_options(writable, is_setup)?;
        if writable {
            // A stale index from a previous mount with different layers
            // makes the kernel refuse the mount.
            self.overlay.clean_workdir(&self.paths.workdir())?;
        }
        self.overlay.mount(&options)?;

        let has_tree_commands = self
            .mod_tree
            .as_ref()
            .is_some_and(|tree| !tree.commands().is_empty());
        if self.effective_run_pre_commands() || has_tree_commands {
            self.run_pre_commands();
        }

        Ok(())
    }

    /// Terminate recorded children, unmount if mounted, and restore the
    /// original directory layout. A no-op when the layout is already normal.
    pub fn deactivate(&self) -> Result<()> {
        self.terminate_recorded_children();

        match self.overlay.classify()? {
            MountState::Normal => return Ok(()),
            MountState::Mounted => self.overlay.unmount()?,
            MountState::Moved => {}
        }

        match fs::remove_dir(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(Error::file(
                    format!("remove empty game directory '{}'", self.path.display()),
                    err,
                ));
            }
        }

        fs::rename(&self.moved_path, &self.path).map_err(|err| {
            Error::file(
                format!(
                    "move '{}' back to '{}'",
                    self.moved_path.display(),
                    self.path.display()
                ),
                err,
            )
        })
    }

    /// Activate, run one command inside the mounted view, deactivate.
    /// Deactivation is attempted even when the command fails.
    pub fn wrap(&self, mut command: ExternalCommand, writable: bool) -> Result<()> {
        self.activate(writable, false)?;

        if let Some(tree) = &self.mod_tree {
            command.merge_environment(&tree.environment());
        }

        if let Err(err) = command.run() {
            tracing::warn!("could not execute wrapped command for game '{}': {err}", self.id);
        }

        thread::sleep(SETTLE);
        self.deactivate()
    }

    /// Collect the changes of an interactive session into a new mod folder:
    /// mount writable with a dedicated upper directory, wait for the user,
    /// unmount, and move the upper directory to `mod_root/<new_mod_id>`.
    pub fn setup(&self, new_mod_id: &str) -> Result<()> {
        let new_mod_path = self.mod_root.join(new_mod_id);
        if new_mod_path.exists() {
            return Err(Error::Value {
                game: self.id.clone(),
                message: format!(
                    "mod '{new_mod_id}' already exists at '{}'",
                    new_mod_path.display()
                ),
            });
        }

        self.activate(true, true)?;

        println!(
            "Make the required changes to the game folder '{}',\n\
             e.g. install an addon or drop mod files into the folder structure.\n\
             Press Enter here when done.",
            self.path.display()
        );
        let _ = open::that(self.path.as_os_str());
        wait_for_enter();

        loop {
            match self.deactivate() {
                Ok(()) => break,
                Err(Error::Busy { .. }) => {
                    println!(
                        "The overlay is still in use. Close the programs listed above and press Enter."
                    );
                    wait_for_enter();
                }
                Err(err) => return Err(err),
            }
        }

        let staging = self.paths.upper_dir(None, true);
        move_directory(&staging, &new_mod_path)?;

        println!(
            "Your mod files are in '{}'. Add '{new_mod_id}' to a mod set of '{}' to apply them.",
            new_mod_path.display(),
            self.id
        );
        Ok(())
    }

    fn is_writable(&self, writable: bool, is_setup: bool) -> bool {
        writable
            || is_setup
            || self.writable
            || self.mod_tree.as_ref().is_some_and(|tree| tree.writable())
    }

    /// Compose the overlay option string: ordered lower directories with the
    /// moved-aside original as the lowest layer, optional upper and work
    /// directories for writable mounts, and an empty dummy layer when
    /// mounting without any set (the overlay needs two lower directories).
    fn mount_options(&self, writable: bool, is_setup: bool) -> Result<String> {
        let mut lowers = match &self.mod_tree {
            Some(tree) => tree.lower_dirs(),
            None => Vec::new(),
        };
        lowers.push(self.moved_path.clone());

        let mut upper = None;
        if writable {
            let upper_dir = self.paths.upper_dir(self.active_set.as_deref(), is_setup);
            let workdir = self.paths.workdir();
            for dir in [&upper_dir, &workdir.join("index"), &workdir.join("work")] {
                fs::create_dir_all(dir).map_err(|err| {
                    Error::file(format!("create overlay directory '{}'", dir.display()), err)
                })?;
            }
            upper = Some((upper_dir, workdir));
        } else if self.mod_tree.is_none() {
            let dummy = self.paths.dummy_dir();
            fs::create_dir_all(&dummy).map_err(|err| {
                Error::file(format!("create dummy directory '{}'", dummy.display()), err)
            })?;
            lowers.push(dummy);
        }

        let lower_list = lowers
            .iter()
            .map(|dir| self.option_path(dir))
            .collect::<Result<Vec<String>>>()?
            .join(":");
        let mut options = format!("x-gvfs-hide,comment=x-gvfs-hide,lowerdir={lower_list}");

        if let Some((upper_dir, workdir)) = upper {
            options.push_str(&format!(
                ",upperdir={},workdir={}",
                self.option_path(&upper_dir)?,
                self.option_path(&workdir)?
            ));
        }

        Ok(options)
    }

    fn option_path(&self, path: &Path) -> Result<String> {
        let raw = path.to_str().ok_or_else(|| Error::Value {
            game: self.id.clone(),
            message: format!("path '{}' is not valid UTF-8", path.display()),
        })?;
        Ok(escape_mount_path(raw))
    }

    fn effective_run_pre_commands(&self) -> bool {
        self.run_pre_commands
            || self
                .mod_tree
                .as_ref()
                .is_some_and(|tree| tree.run_pre_commands())
    }

    /// Launch the global pre-commands (when enabled) followed by the set
    /// tree's attached commands, and record a PID marker for every child
    /// that keeps running. Failures here never abort an activation.
    fn run_pre_commands(&self) {
        let mut commands: Vec<ExternalCommand> = Vec::new();

        if self.effective_run_pre_commands() {
            for (index, spec) in self.pre_command_specs.iter().enumerate() {
                match ExternalCommand::from_spec(&self.id, &index.to_string(), spec) {
                    Ok(command) => commands.push(command),
                    Err(err) => {
                        tracing::warn!("skipping pre-command {index} for game '{}': {err}", self.id)
                    }
                }
            }
        }

        if let Some(tree) = &self.mod_tree {
            for command in tree.commands() {
                if !commands.iter().any(|existing| existing.id == command.id) {
                    commands.push(command.clone());
                }
            }
        }

        if commands.is_empty() {
            return;
        }

        let Some(runtime_dir) = &self.paths.runtime_dir else {
            tracing::warn!(
                "no runtime directory available for game '{}', pre-commands were not started",
                self.id
            );
            return;
        };
        if let Err(err) = fs::create_dir_all(runtime_dir) {
            tracing::warn!(
                "could not create runtime directory '{}': {err}, pre-commands were not started",
                runtime_dir.display()
            );
            return;
        }

        let mut running: Vec<Child> = Vec::new();
        for command in &commands {
            match command.run() {
                Ok(Some(child)) => running.push(child),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!("failed to run pre-command '{}' for game '{}': {err}",
                        command.id,
                        self.id
                    );
                }
            }
        }

        for child in running {
            let marker = runtime_dir.join(child.id().to_string());
            if let Err(err) = fs::write(&marker, "") {
                tracing::warn!(
                    "could not record PID {} for game '{}': {err}, the process will not be terminated on deactivation",
                    child.id(),
                    self.id
                );
            }
        }
    }

    /// Send SIGTERM to every child recorded under the runtime directory and
    /// drop the markers. Per-PID failures are logged and skipped; a child
    /// that ignores the signal can still block the following unmount.
    fn terminate_recorded_children(&self) {
        let Some(runtime_dir) = &self.paths.runtime_dir else {
            return;
        };
        let entries = match fs::read_dir(runtime_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return,
            Err(err) => {
                tracing::warn!(
                    "could not read runtime directory '{}': {err}",
                    runtime_dir.display()
                );
                return;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!("could not read runtime entry for game '{}': {err}", self.id);
                    continue;
                }
            };

            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|name| name.parse::<i32>().ok()) else {
                tracing::warn!(
                    "ignoring stray runtime file '{}' for game '{}'",
                    entry.path().display(),
                    self.id
                );
                continue;
            };

            let Some(pid) = Pid::from_raw(pid) else {
                tracing::warn!("invalid PID {pid} recorded for game '{}'", self.id);
                continue;
            };
            if let Err(err) = kill_process(pid, Signal::Term) {
                tracing::warn!(
                    "terminating process {} for game '{}' failed: {err}",
                    entry.path().display(),
                    self.id
                );
                continue;
            }

            if let Err(err) = fs::remove_file(entry.path()) {
                tracing::warn!(
                    "could not remove PID file '{}' for game '{}': {err}",
                    entry.path().display(),
                    self.id
                );
            }
        }
    }
}

fn escape_mount_path(raw: &str) -> String {
    raw.replace('\\', r"\\").replace(',', r"\,").replace(':', r"\:")
}

fn wait_for_enter() {
    let mut line = String::new();
    if let Err(err) = stdin().read_line(&mut line) {
        tracing::warn!("reading from standard input failed: {err}");
    }
}

fn move_directory(source: &Path, dest: &Path) -> Result<()> {
    if fs::rename(source, dest).is_ok() {
        return Ok(());
    }

    // cache and data homes may live on different filesystems
    copy_dir_recursive(source, dest).map_err(|err| {
        Error::file(
            format!("copy '{}' to '{}'", source.display(), dest.display()),
            err,
        )
    })?;
    fs::remove_dir_all(source).map_err(|err| {
        Error::file(
            format!("remove staging directory '{}'", source.display()),
            err,
        )
    })
}

fn copy_dir_recursive(source: &Path, dest: &Path) -> io::Result<()> {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let rel = match entry.path().strip_prefix(source) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn build_game(
        root: &TempDir,
        extra_config: &str,
        set_override: Option<&str>,
        mods: &[&str],
    ) -> Game {
        let game_path = root.path().join("game");
        fs::create_dir_all(&game_path).unwrap();
        fs::write(game_path.join("data.bin"), "data").unwrap();

        let mod_root = root.path().join("mods");
        for name in mods {
            fs::create_dir_all(mod_root.join(name)).unwrap();
        }

        let dirs = Dirs::from_roots(
            root.path().join("config"),
            root.path().join("data"),
            root.path().join("cache"),
            None,
        );

        let raw = format!(
            "path = \"{}\"\nmod_root_path = \"{}\"\n{extra_config}",
            game_path.display(),
            mod_root.display()
        );
        let config = GameConfig::parse(&raw, "test_game").unwrap();
        Game::from_config(
            &dirs,
            "test_game",
            set_override.map(String::from),
            config,
            &MainConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn options_list_lowers_in_declaration_order() {
        let root = TempDir::new().unwrap();
        let game = build_game(
            &root,
            r#"
            active = "s"
            [s]
            mods = ["a", "n"]
            [n]
            mods = ["b", "c"]
            "#,
            None,
            &["a", "b", "c"],
        );

        let mods = root.path().join("mods");
        let expected = format!(
            "x-gvfs-hide,comment=x-gvfs-hide,lowerdir={}:{}:{}:{}_mod-manager",
            mods.join("a").display(),
            mods.join("b").display(),
            mods.join("c").display(),
            root.path().join("game").display()
        );
        assert_eq!(game.mount_options(false, false).unwrap(), expected);
    }

    #[test]
    fn empty_set_override_mounts_moved_plus_dummy() {
        let root = TempDir::new().unwrap();
        let game = build_game(
            &root,
            r#"
            active = "s"
            [s]
            mods = ["a"]
            "#,
            Some(""),
            &["a"],
        );

        let dummy = root
            .path()
            .join("cache")
            .join("test_game")
            .join("mod-manager_empty_dummy");
        let expected = format!(
            "x-gvfs-hide,comment=x-gvfs-hide,lowerdir={}_mod-manager:{}",
            root.path().join("game").display(),
            dummy.display()
        );
        let options = game.mount_options(false, false).unwrap();
        assert_eq!(options, expected);
        assert!(!options.contains("upperdir="));
        assert!(dummy.is_dir());
    }

    #[test]
    fn nested_writable_set_makes_the_mount_writable() {
        let root = TempDir::new().unwrap();
        let game = build_game(
            &root,
            r#"
            active = "s"
            [s]
            mods = ["a", "n"]
            [n]
            mods = ["b"]
            writable = true
            "#,
            None,
            &["a", "b"],
        );

        assert!(game.is_writable(false, false));

        let cache = root.path().join("cache").join("test_game");
        let options = game.mount_options(true, false).unwrap();
        assert!(options.contains(&format!(",upperdir={}", cache.join("s_persistent").display())));
        assert!(options.contains(&format!(",workdir={}", cache.join("workdir").display())));
        assert!(cache.join("s_persistent").is_dir());
        assert!(cache.join("workdir").join("index").is_dir());
        assert!(cache.join("workdir").join("work").is_dir());
    }

    #[test]
    fn setup_mount_uses_the_setup_upper_dir() {
        let root = TempDir::new().unwrap();
        let game = build_game(&root, "", Some(""), &[]);

        assert!(game.is_writable(false, true));
        let options = game.mount_options(true, true).unwrap();
        assert!(options.contains("persistent_setup"));
        assert!(!options.contains("mod-manager_empty_dummy"));
    }

    #[test]
    fn modless_writable_mount_uses_the_modless_upper_dir() {
        let root = TempDir::new().unwrap();
        let game = build_game(&root, "writable = true", Some(""), &[]);

        assert!(game.is_writable(false, false));
        let options = game.mount_options(true, false).unwrap();
        assert!(options.contains("persistent_modless"));
    }

    #[test]
    fn special_characters_in_lower_dirs_are_escaped() {
        let root = TempDir::new().unwrap();
        let game = build_game(
            &root,
            r#"
            active = "s"
            [s]
            mods = ["with, comma"]
            "#,
            None,
            &["with, comma"],
        );

        let options = game.mount_options(false, false).unwrap();
        assert!(options.contains(r"with\, comma"));
    }

    #[test]
    fn missing_path_is_rejected() {
        let root = TempDir::new().unwrap();
        let dirs = Dirs::from_roots(
            root.path().join("config"),
            root.path().join("data"),
            root.path().join("cache"),
            None,
        );
        let config = GameConfig::parse("writable = true", "test_game").unwrap();
        let result = Game::from_config(&dirs, "test_game", None, config, &MainConfig::default());
        assert!(matches!(
            result,
            Err(Error::KeyMissing { key, .. }) if key == "path"
        ));
    }

    #[test]
    fn default_game_root_fills_in_a_missing_path() {
        let root = TempDir::new().unwrap();
        let dirs = Dirs::from_roots(
            root.path().join("config"),
            root.path().join("data"),
            root.path().join("cache"),
            None,
        );
        let main = MainConfig {
            editor: None,
            default: crate::config::DefaultRoots {
                game_root_path: Some(root.path().join("games")),
                mod_root_path: None,
            },
        };
        let config = GameConfig::parse("", "test_game").unwrap();
        let game = Game::from_config(&dirs, "test_game", None, config, &main).unwrap();
        assert_eq!(game.path, root.path().join("games").join("test_game"));
        assert_eq!(
            game.moved_path,
            moved_path_for(&root.path().join("games").join("test_game"))
        );
    }

    #[test]
    fn deactivate_is_a_no_op_in_normal_state() {
        let root = TempDir::new().unwrap();
        let game = build_game(&root, "", Some(""), &[]);
        game.deactivate().unwrap();
        game.deactivate().unwrap();
        assert!(root.path().join("game").join("data.bin").exists());
    }

    #[test]
    fn deactivate_recovers_a_moved_layout() {
        let root = TempDir::new().unwrap();
        let game = build_game(&root, "", Some(""), &[]);

        let game_path = root.path().join("game");
        let moved = moved_path_for(&game_path);
        fs::rename(&game_path, &moved).unwrap();

        game.deactivate().unwrap();
        assert!(game_path.join("data.bin").exists());
        assert!(!moved.exists());
    }

    #[test]
    fn deactivate_recovers_a_moved_layout_with_leftover_mount_target() {
        let root = TempDir::new().unwrap();
        let game = build_game(&root, "", Some(""), &[]);

        let game_path = root.path().join("game");
        let moved = moved_path_for(&game_path);
        fs::rename(&game_path, &moved).unwrap();
        fs::create_dir(&game_path).unwrap();

        game.deactivate().unwrap();
        assert!(game_path.join("data.bin").exists());
        assert!(!moved.exists());
    }

    #[test]
    fn move_directory_copies_across_rename_failures() {
        let root = TempDir::new().unwrap();
        let source = root.path().join("staging");
        fs::create_dir_all(source.join("sub")).unwrap();
        fs::write(source.join("sub").join("file"), "payload").unwrap();

        let dest = root.path().join("mods").join("newmod");
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        move_directory(&source, &dest).unwrap();

        assert_eq!(
            fs::read_to_string(dest.join("sub").join("file")).unwrap(),
            "payload"
        );
        assert!(!source.exists());
    }
}

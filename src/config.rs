use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Typed view of the reserved `config.toml` holding cross-game defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MainConfig {
    pub editor: Option<String>,
    #[serde(default)]
    pub default: DefaultRoots,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefaultRoots {
    pub game_root_path: Option<PathBuf>,
    pub mod_root_path: Option<PathBuf>,
}

impl MainConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(MainConfig::default());
        }
        let raw = fs::read_to_string(path)
            .map_err(|err| Error::file(format!("read '{}'", path.display()), err))?;
        toml::from_str(&raw).map_err(|err| Error::Value {
            game: "config".to_string(),
            message: format!("could not parse '{}': {err}", path.display()),
        })
    }
}

/// Typed view of a per-game `<gameID>.toml`. Every top-level table that is
/// not a known key is either a mod set (has a `mods` array) or a named
/// command (has a `command` array); anything else is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct GameConfig {
    pub path: Option<PathBuf>,
    pub active: Option<String>,
    pub mod_root_path: Option<PathBuf>,
    #[serde(default)]
    pub writable: bool,
    #[serde(default, alias = "run_pre_commands")]
    pub run_pre_command: bool,
    #[serde(default)]
    pub pre_command: Vec<CommandSpec>,
    #[serde(flatten)]
    tables: HashMap<String, TableSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TableSpec {
    Set(SetSpec),
    Command(CommandSpec),
    Other(toml::Value),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetSpec {
    pub mods: Vec<String>,
    #[serde(default)]
    pub writable: bool,
    #[serde(default, alias = "run_pre_commands")]
    pub run_pre_command: bool,
    pub command: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandSpec {
    pub command: Vec<String>,
    #[serde(default = "default_true")]
    pub wait_for_exit: bool,
    #[serde(default)]
    pub delay_after: u64,
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

impl GameConfig {
    pub fn load(path: &Path, game_id: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            Error::file(
                format!("read config for game '{game_id}' at '{}'", path.display()),
                err,
            )
        })?;
        GameConfig::parse(&raw, game_id)
    }

    pub fn parse(raw: &str, game_id: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|err| Error::Value {
            game: game_id.to_string(),
            message: format!("could not parse config: {err}"),
        })
    }

    pub fn set(&self, name: &str) -> Option<&SetSpec> {
        match self.tables.get(name) {
            Some(TableSpec::Set(spec)) => Some(spec),
            _ => None,
        }
    }

    pub fn named_command(&self, name: &str) -> Option<&CommandSpec> {
        match self.tables.get(name) {
            Some(TableSpec::Command(spec)) => Some(spec),
            _ => None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Skeleton written by `edit` when no config exists for the game yet.
pub fn template(game_path: Option<&Path>) -> String {
    let path = game_path
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/home/username/.local/share/Steam/steamapps/common/game".to_string());
    format!(
        r#"active = ""
path = "{path}"
# mod_root_path = "/mnt/mods/game"

["set1"]
mods = [
    "mod1",
    "mod2",
    "mod3",
]
"#
    )
}

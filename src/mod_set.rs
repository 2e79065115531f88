use crate::command::ExternalCommand;
use crate::config::GameConfig;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A resolved mod set: the ordered members of one named set, with nested
/// sets resolved in place. Construction proves the tree acyclic and every
/// leaf folder present, so the derived fold operations cannot recurse
/// forever.
#[derive(Debug, Clone)]
pub struct ModSet {
    members: Vec<Member>,
    mod_root: PathBuf,
    writable: bool,
    run_pre_commands: bool,
    command: Option<ExternalCommand>,
    environment: HashMap<String, String>,
}

#[derive(Debug, Clone)]
enum Member {
    Mod(String),
    Set(ModSet),
}

impl ModSet {
    pub fn resolve(
        name: &str,
        config: &GameConfig,
        game_id: &str,
        mod_root: &Path,
    ) -> Result<Self> {
        let mut ancestors = Vec::new();
        ModSet::resolve_inner(name, config, game_id, mod_root, &mut ancestors)
    }

    fn resolve_inner(
        name: &str,
        config: &GameConfig,
        game_id: &str,
        mod_root: &Path,
        ancestors: &mut Vec<String>,
    ) -> Result<Self> {
        let spec = config.set(name).ok_or_else(|| Error::KeyMissing {
            game: game_id.to_string(),
            key: name.to_string(),
        })?;

        if spec.mods.is_empty() {
            return Err(Error::ArrayEmpty {
                game: game_id.to_string(),
                key: format!("{name}.mods"),
            });
        }

        ancestors.push(name.to_string());
        let mut members = Vec::with_capacity(spec.mods.len());
        for member in &spec.mods {
            if config.set(member).is_some() {
                if ancestors.iter().any(|ancestor| ancestor == member) {
                    return Err(Error::Recursion {
                        game: game_id.to_string(),
                        set: member.clone(),
                    });
                }
                members.push(Member::Set(ModSet::resolve_inner(
                    member, config, game_id, mod_root, ancestors,
                )?));
            } else {
                let dir = mod_root.join(member);
                if !dir.is_dir() {
                    return Err(Error::FolderMissing {
                        game: game_id.to_string(),
                        path: dir,
                    });
                }
                members.push(Member::Mod(member.clone()));
            }
        }
        ancestors.pop();

        let command = match &spec.command {
            Some(command_name) => {
                let command_spec =
                    config
                        .named_command(command_name)
                        .ok_or_else(|| Error::KeyMissing {
                            game: game_id.to_string(),
                            key: command_name.clone(),
                        })?;
                Some(ExternalCommand::from_spec(
                    game_id,
                    command_name,
                    command_spec,
                )?)
            }
            None => None,
        };

        Ok(ModSet {
            members,
            mod_root: mod_root.to_path_buf(),
            writable: spec.writable,
            run_pre_commands: spec.run_pre_command,
            command,
            environment: spec.environment.clone(),
        })
    }

    /// Ordered lower directories for the overlay mount: members in
    /// declaration order, nested sets spliced in place, duplicates removed
    /// keeping the first occurrence. Earlier entries take precedence.
    pub fn lower_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        self.collect_lower_dirs(&mut dirs);
        dirs
    }

    fn collect_lower_dirs(&self, out: &mut Vec<PathBuf>) {
        for member in &self.members {
            match member {
                Member::Mod(name) => {
                    let dir = self.mod_root.join(name);
                    if !out.contains(&dir) {
                        out.push(dir);
                    }
                }
                Member::Set(set) => set.collect_lower_dirs(out),
            }
        }
    }

    /// All commands attached in the subtree, nested sets first, deduplicated
    /// by command id.
    pub fn commands(&self) -> Vec<&ExternalCommand> {
        let mut commands = Vec::new();
        self.collect_commands(&mut commands);
        commands
    }

    fn collect_commands<'a>(&'a self, out: &mut Vec<&'a ExternalCommand>) {
        for member in &self.members {
            if let Member::Set(set) = member {
                set.collect_commands(out);
            }
        }
        if let Some(command) = &self.command {
            if !out.iter().any(|existing| existing.id == command.id) {
                out.push(command);
            }
        }
    }

    pub fn writable(&self) -> bool {
        self.writable
            || self.members.iter().any(|member| match member {
                Member::Set(set) => set.writable(),
                Member::Mod(_) => false,
            })
    }

    pub fn run_pre_commands(&self) -> bool {
        self.run_pre_commands
            || self.members.iter().any(|member| match member {
                Member::Set(set) => set.run_pre_commands(),
                Member::Mod(_) => false,
            })
    }

    /// Environment variables of the whole subtree; nested definitions
    /// override the parent's on key collisions.
    pub fn environment(&self) -> HashMap<String, String> {
        let mut vars = self.environment.clone();
        for member in &self.members {
            if let Member::Set(set) = member {
                for (key, value) in set.environment() {
                    vars.insert(key, value);
                }
            }
        }
        vars
    }
}

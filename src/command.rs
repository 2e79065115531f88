use crate::config::CommandSpec;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::io;
use std::process::{Child, Command};
use std::thread;
use std::time::Duration;

/// A configured auxiliary process: argv spawned verbatim (no shell), with an
/// environment overlay on top of the inherited environment.
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    pub id: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    wait_for_exit: bool,
    delay_after: u64,
}

impl ExternalCommand {
    pub fn new(id: impl Into<String>, args: Vec<String>, wait_for_exit: bool) -> Self {
        ExternalCommand {
            id: id.into(),
            args,
            env: HashMap::new(),
            wait_for_exit,
            delay_after: 0,
        }
    }

    pub fn from_spec(game_id: &str, id: &str, spec: &CommandSpec) -> Result<Self> {
        if spec.command.is_empty() {
            return Err(Error::ArrayEmpty {
                game: game_id.to_string(),
                key: format!("{id}.command"),
            });
        }
        if spec.command.iter().any(|arg| arg.is_empty()) {
            return Err(Error::Value {
                game: game_id.to_string(),
                message: format!("command `{id}` contains an empty argument"),
            });
        }

        Ok(ExternalCommand {
            id: id.to_string(),
            args: spec.command.clone(),
            env: spec.environment.clone(),
            wait_for_exit: spec.wait_for_exit,
            delay_after: spec.delay_after,
        })
    }

    /// Spawn the command. Waiting commands block until the child exits and
    /// return no handle; non-waiting commands hand the live child back to
    /// the caller. Sleeps `delay_after` before returning either way.
    pub fn run(&self) -> io::Result<Option<Child>> {
        let mut child = Command::new(&self.args[0])
            .args(&self.args[1..])
            .envs(&self.env)
            .spawn()?;

        if !self.wait_for_exit {
            self.delay();
            return Ok(Some(child));
        }

        match child.wait() {
            Ok(status) if !status.success() => {
                tracing::warn!(
                    "command '{}' ({}) exited with {status}",
                    self.id,
                    self.args[0]
                );
            }
            Ok(_) => {}
            Err(err) => tracing::warn!("waiting for command '{}' failed: {err}", self.id),
        }

        self.delay();
        Ok(None)
    }

    /// Overlay `vars` onto this command's environment.
    pub fn merge_environment(&mut self, vars: &HashMap<String, String>) {
        for (key, value) in vars {
            self.env.insert(key.clone(), value.clone());
        }
    }

    fn delay(&self) {
        if self.delay_after > 0 {
            thread::sleep(Duration::from_secs(self.delay_after));
        }
    }
}

use crate::{
    command::ExternalCommand,
    config::{self, MainConfig},
    game::Game,
    paths::Dirs,
};
use anyhow::{bail, Context, Result};
use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

enum CliAction {
    Activate {
        game: Option<String>,
        set: Option<String>,
        writable: bool,
    },
    Deactivate {
        game: Option<String>,
    },
    Wrap {
        game: String,
        set: Option<String>,
        writable: bool,
        command: Vec<String>,
    },
    Setup {
        game: String,
        mod_id: String,
        path: Option<PathBuf>,
        set: Option<String>,
    },
    Edit {
        game: String,
        path: Option<PathBuf>,
    },
    Help,
    Version,
}

pub fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let action = parse_args(&args)?;

    match action {
        CliAction::Help => {
            print_help();
            return Ok(());
        }
        CliAction::Version => {
            println!("mod-manager v{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    let dirs = Dirs::from_env().context("resolve user directories")?;
    let main_config = MainConfig::load(&dirs.main_config_file())?;

    match action {
        CliAction::Activate {
            game,
            set,
            mut writable,
        } => {
            if game.is_none() {
                // Never make every configured game writable in one go
                writable = false;
            }
            let games = game_list(&dirs, &main_config, game, set)?;

            let mut failed = false;
            for game in &games {
                if let Err(err) = game.activate(writable, false) {
                    tracing::error!("activating game overlay '{}' failed: {err}", game.id);
                    failed = true;
                    break;
                }
            }

            if failed {
                for game in &games {
                    cleanup(game);
                }
                bail!("activation failed");
            }
            Ok(())
        }
        CliAction::Deactivate { game } => {
            let mut failed = false;
            for game in game_list(&dirs, &main_config, game, None)? {
                if let Err(err) = game.deactivate() {
                    tracing::error!("deactivating game overlay '{}' failed: {err}", game.id);
                    failed = true;
                }
            }
            if failed {
                bail!("deactivation failed");
            }
            Ok(())
        }
        CliAction::Wrap {
            game,
            set,
            writable,
            command,
        } => {
            let game = Game::from_config_file(&dirs, &game, set, &main_config)?;
            if let Err(err) = game.wrap(ExternalCommand::new("wrap", command, true), writable) {
                cleanup(&game);
                return Err(err.into());
            }
            Ok(())
        }
        CliAction::Setup {
            game: game_id,
            mod_id,
            path,
            set,
        } => {
            if !dirs.config_file(&game_id).exists() {
                println!("No config file for \"{game_id}\" yet, creating one…");
                edit_config(&dirs, &main_config, &game_id, path.as_deref())?;
            }

            let game = Game::from_config_file(&dirs, &game_id, set, &main_config)?;
            if let Err(err) = game.setup(&mod_id) {
                cleanup(&game);
                return Err(err.into());
            }
            Ok(())
        }
        CliAction::Edit { game, path } => edit_config(&dirs, &main_config, &game, path.as_deref()),
        CliAction::Help | CliAction::Version => Ok(()),
    }
}

/// Best-effort deactivation after a failed action, so no overlay mount or
/// moved-aside directory leaks. The primary error stays the one surfaced.
fn cleanup(game: &Game) {
    if let Err(err) = game.deactivate() {
        tracing::error!("cleanup deactivation for game '{}' failed: {err}", game.id);
    }
}

fn parse_args(args: &[String]) -> Result<CliAction> {
    if args.is_empty() {
        return Ok(CliAction::Help);
    }
    if matches!(
        args.first().map(|arg| arg.as_str()),
        Some("--help" | "-h" | "help")
    ) {
        return Ok(CliAction::Help);
    }
    if matches!(
        args.first().map(|arg| arg.as_str()),
        Some("--version" | "-V" | "version")
    ) {
        return Ok(CliAction::Version);
    }

    let rest = &args[1..];
    match args[0].as_str() {
        "activate" => {
            let options = parse_options(rest)?;
            Ok(CliAction::Activate {
                game: one_optional_positional(options.positional, "activate")?,
                set: options.set,
                writable: options.writable,
            })
        }
        "deactivate" => {
            let options = parse_options(rest)?;
            if options.set.is_some() || options.writable {
                bail!("deactivate takes no options besides GAME");
            }
            Ok(CliAction::Deactivate {
                game: one_optional_positional(options.positional, "deactivate")?,
            })
        }
        "wrap" => {
            let Some(split) = rest.iter().position(|arg| arg == "--") else {
                bail!("wrap requires '--' before the wrapped command");
            };
            let command: Vec<String> = rest[split + 1..].to_vec();
            if command.is_empty() {
                bail!("missing command to wrap");
            }
            let options = parse_options(&rest[..split])?;
            let [game] = options.positional.as_slice() else {
                bail!("wrap requires exactly one GAME");
            };
            Ok(CliAction::Wrap {
                game: game.clone(),
                set: options.set,
                writable: options.writable,
                command,
            })
        }
        "setup" => {
            let options = parse_options(rest)?;
            let [game, mod_id] = options.positional.as_slice() else {
                bail!("setup requires GAME and MOD");
            };
            Ok(CliAction::Setup {
                game: game.clone(),
                mod_id: mod_id.clone(),
                path: options.path,
                set: options.set,
            })
        }
        "edit" => {
            let options = parse_options(rest)?;
            let [game] = options.positional.as_slice() else {
                bail!("edit requires exactly one GAME");
            };
            Ok(CliAction::Edit {
                game: game.clone(),
                path: options.path,
            })
        }
        unknown => bail!("Unknown command: {unknown} (see 'mod-manager help')"),
    }
}

#[derive(Default)]
struct ActionOptions {
    positional: Vec<String>,
    set: Option<String>,
    writable: bool,
    path: Option<PathBuf>,
}

fn parse_options(tokens: &[String]) -> Result<ActionOptions> {
    let mut options = ActionOptions::default();
    let mut iter = tokens.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--set=") {
            options.set = Some(value.to_string());
            continue;
        }
        if arg == "--set" {
            match iter.next() {
                Some(value) => options.set = Some(value.clone()),
                None => bail!("--set requires a value"),
            }
            continue;
        }
        if let Some(value) = arg.strip_prefix("--path=") {
            options.path = Some(PathBuf::from(value));
            continue;
        }
        if arg == "--path" {
            match iter.next() {
                Some(value) => options.path = Some(PathBuf::from(value)),
                None => bail!("--path requires a value"),
            }
            continue;
        }
        if arg == "--writable" {
            options.writable = true;
            continue;
        }
        if arg.starts_with('-') {
            bail!("Unknown option: {arg}");
        }
        options.positional.push(arg.clone());
    }
    Ok(options)
}

fn one_optional_positional(positional: Vec<String>, command: &str) -> Result<Option<String>> {
    if positional.len() > 1 {
        bail!("{command} takes at most one GAME");
    }
    Ok(positional.into_iter().next())
}

/// One game when an ID is given, otherwise one per config file found.
/// Construction failures of enumerated games downgrade to warnings so a
/// single broken config does not block the rest.
fn game_list(
    dirs: &Dirs,
    main: &MainConfig,
    game_id: Option<String>,
    set_override: Option<String>,
) -> Result<Vec<Game>> {
    if let Some(game_id) = game_id {
        return Ok(vec![Game::from_config_file(
            dirs,
            &game_id,
            set_override,
            main,
        )?]);
    }

    let mut games = Vec::new();
    for config_file in list_config_files(dirs)? {
        let Some(id) = config_file.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        match Game::from_config_file(dirs, id, None, main) {
            Ok(game) => games.push(game),
            Err(err) => tracing::warn!("skipping game '{id}': {err}"),
        }
    }
    Ok(games)
}

fn list_config_files(dirs: &Dirs) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dirs.config_root()) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("read config directory '{}'", dirs.config_root().display()));
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
        .filter(|path| path.file_name().is_some_and(|name| name != "config.toml"))
        .collect();
    files.sort();
    Ok(files)
}

fn edit_config(
    dirs: &Dirs,
    main: &MainConfig,
    game_id: &str,
    game_path: Option<&Path>,
) -> Result<()> {
    fs::create_dir_all(dirs.config_root()).context("create config directory")?;

    let config_file = dirs.config_file(game_id);
    if !config_file.exists() {
        fs::write(&config_file, config::template(game_path))
            .with_context(|| format!("create config file '{}'", config_file.display()))?;
    }

    let editor = main
        .editor
        .clone()
        .or_else(|| env::var("EDITOR").ok())
        .filter(|editor| !editor.is_empty())
        .unwrap_or_else(|| "vi".to_string());
    let config_arg = config_file
        .to_str()
        .context("config path is not valid UTF-8")?
        .to_string();

    ExternalCommand::new("editor", vec![editor, config_arg], true)
        .run()
        .context("launch editor")?;
    Ok(())
}

fn print_help() {
    println!("mod-manager v{}", env!("CARGO_PKG_VERSION"));
    println!("Activates game mod sets by mounting an OverlayFS over the game directory.");
    println!();
    println!("Usage:");
    println!("  mod-manager activate [GAME] [--set SET] [--writable]");
    println!("      Mount the overlay for GAME, or for every configured game");
    println!("  mod-manager deactivate [GAME]");
    println!("      Unmount and restore the original directory layout");
    println!("  mod-manager wrap <GAME> [--set SET] [--writable] -- <COMMAND>...");
    println!("      Run COMMAND between an activation and a deactivation");
    println!("  mod-manager setup <GAME> <MOD> [--path PATH] [--set SET]");
    println!("      Collect interactive changes into a new mod folder");
    println!("  mod-manager edit <GAME> [--path PATH]");
    println!("      Edit or create the game's configuration file with $EDITOR");
    println!("  mod-manager help");
    println!();
    println!("Options:");
    println!("  --set SET        Override the configured active set; \"\" disables all layering");
    println!("  --writable       Mount with write access (ignored without an explicit GAME)");
    println!("  --path PATH      Game directory used when creating a new config file");
    println!("  -h, --help       Show help");
    println!("  -V, --version    Show version");
}

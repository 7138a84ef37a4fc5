use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Watches drop folders and feeds their files to rules, baselines and plugins.
#[derive(Parser, Debug)]
#[command(name = "dropzone-agent", version)]
pub struct Cli {
    /// Configuration file (TOML or JSON). Without it `$DROPZONE_CONFIG_PATH`,
    /// `$DROPZONE_CONFIG_JSON` and `dropzone.toml` are tried in turn.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start every configured pipeline and run until Ctrl-C (default).
    Run,
    /// Print where the configuration came from and any warnings.
    CheckConfig,
    /// Manage the plugin library.
    Plugins {
        #[command(subcommand)]
        action: PluginCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum PluginCommand {
    /// List registered and configured plugins.
    List,
    /// Validate a module and copy it into the library.
    Add { module: PathBuf },
    /// Remove a plugin from the library.
    Remove { name: String },
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_is_the_default() {
        let cli = Cli::try_parse_from(["dropzone-agent"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn parses_plugin_commands() {
        let cli = Cli::try_parse_from([
            "dropzone-agent",
            "plugins",
            "add",
            "sink.wasm",
            "--config",
            "agent.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("agent.toml")));
        assert!(matches!(
            cli.command,
            Some(Command::Plugins { action: PluginCommand::Add { ref module } }) if module == &PathBuf::from("sink.wasm")
        ));
    }
}

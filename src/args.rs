//! This module defines the command line arguments postgraph accepts.

use std::path::PathBuf;
use termcolor::ColorChoice;

use crate::db::cmd::DbCommand;


#[derive(Debug, clap::Parser)]
#[command(about = "GraphQL API server for users, posts and comments.", version)]
pub(crate) struct Args {
    #[command(subcommand)]
    pub(crate) cmd: Command,

    /// Whether to use colors when printing to stdout and stderr. Can be
    /// overridden per stream by `--stdout-color` and `--stderr-color`.
    #[arg(long, global = true, default_value = "auto")]
    pub(crate) color: ColorArg,

    /// Color choice for stdout only.
    #[arg(long, global = true)]
    pub(crate) stdout_color: Option<ColorArg>,

    /// Color choice for stderr only.
    #[arg(long, global = true)]
    pub(crate) stderr_color: Option<ColorArg>,
}

#[derive(Debug, clap::Subcommand)]
pub(crate) enum Command {
    /// Starts the HTTP server serving the GraphQL API.
    Serve {
        #[command(flatten)]
        shared: Shared,
    },

    /// Database operations.
    Db {
        #[command(subcommand)]
        cmd: DbCommand,

        #[command(flatten)]
        shared: Shared,
    },

    /// Checks the configuration and the database connection. Exits with 0 if
    /// everything is Ok, and with 1 otherwise.
    Check {
        #[command(flatten)]
        shared: Shared,
    },

    /// Outputs a template for the configuration file (which includes
    /// descriptions of all options).
    WriteConfig {
        /// Target file. If not specified, the template is written to stdout.
        target: Option<PathBuf>,
    },

    /// Exports the API as GraphQL schema (SDL).
    ExportApiSchema {
        /// Target file. If not specified, the schema is written to stdout.
        target: Option<PathBuf>,
    },
}

impl Command {
    /// Short name used in log file paths (`${cmd}`).
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Serve { .. } => "serve",
            Self::Db { .. } => "db",
            _ => "other",
        }
    }
}

#[derive(Debug, clap::Args)]
pub(crate) struct Shared {
    /// Path to the configuration file. If this is not specified, postgraph
    /// checks `POSTGRAPH_CONFIG_PATH`, then `config.toml` and
    /// `/etc/postgraph/config.toml`. Running without any file is fine: then
    /// only environment variables and defaults are used.
    #[arg(short, long)]
    pub(crate) config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum ColorArg {
    Auto,
    Always,
    Never,
}

impl From<ColorArg> for ColorChoice {
    fn from(value: ColorArg) -> Self {
        match value {
            ColorArg::Auto => ColorChoice::Auto,
            ColorArg::Always => ColorChoice::Always,
            ColorArg::Never => ColorChoice::Never,
        }
    }
}

impl Args {
    pub(crate) fn stdout_color(&self) -> ColorChoice {
        self.stdout_color.unwrap_or(self.color).into()
    }

    pub(crate) fn stderr_color(&self) -> ColorChoice {
        self.stderr_color.unwrap_or(self.color).into()
    }
}

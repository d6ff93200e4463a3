use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "symdex - a persisted name index")]
pub struct ArgsParser {
    #[arg(
        long,
        short,
        global = true,
        help = "config file (TOML). the database path given on the command line takes precedence over the one in the config"
    )]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Initialize a new database at <path>
    Init {
        #[arg(help = "path of the database to initialize")]
        path: PathBuf,
        #[arg(
            long,
            short,
            help = "overwrite whatever <path> contains (even if it is not a database)"
        )]
        force: bool,
    },
    /// Report the current usage of the database (amnt, percentage, chunks)
    Usage {
        #[arg(help = "path of the database to investigate")]
        path: PathBuf,
    },
    /// Add (or update) a name
    Add {
        path: PathBuf,
        name: String,
        location: String,
        #[arg(long, short, default_value = "0", help = "line number within <location>")]
        line: i32,
    },
    /// List every name starting with <prefix> (case-insensitive)
    Find {
        path: PathBuf,
        prefix: String,
        #[arg(long, short, help = "stop after this many results")]
        limit: Option<usize>,
    },
    /// Remove a name
    Remove { path: PathBuf, name: String },
}

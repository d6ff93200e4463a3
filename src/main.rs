#[macro_use]
extern crate tracing;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use symdex::{
    config::{self, Config},
    db::{
        fmt_size,
        store::{disk::DiskMode, DiskStore},
        Database,
    },
    job::{Monitor, Policy},
    names::Entry,
    Session,
};

mod args;

use args::{ArgsParser, Cmd};

/// the loaded config file if there is one, with `path` as the database
fn with_database(file: &Option<Config>, path: PathBuf) -> Config {
    match file {
        Some(config) => {
            let mut config = config.clone();
            config.database.path = path;
            config
        }
        None => Config::for_database(path),
    }
}

#[cfg(test)]
#[test]
fn database_path_overrides_the_config_file() {
    let mut file = Config::for_database("from-file.db".into());
    file.database.grow_by = 4096;
    file.log.level = "debug".into();
    let config = with_database(&Some(file), "cli.db".into());
    assert_eq!(config.database.path, PathBuf::from("cli.db"));
    assert_eq!(config.database.grow_by, 4096);
    assert_eq!(config.log.level, "debug");
    assert_eq!(
        with_database(&None, "cli.db".into()),
        Config::for_database("cli.db".into())
    );
}

fn main() -> Result<()> {
    let args = ArgsParser::parse();
    let config_file = args.config.map(config::open).transpose()?;
    let log_level = match &config_file {
        Some(config) => config.log.level.clone(),
        None => config::Log::default().level,
    };
    symdex::log::init_logging(&log_level)?;

    match args.cmd {
        Cmd::Init { path, force } => {
            let store = DiskStore::open(&path, DiskMode::Dynamic)
                .with_context(|| format!("failed to open {path:?}"))?;
            let db = if force {
                warn!("--force specified, anything in {path:?} will be overwritten");
                Database::create(store)?
            } else {
                Database::open(store).with_context(|| {
                    format!("{path:?} contains something else (use --force to overwrite it)")
                })?
            };
            info!("Initialized database at {path:?}");
            db.close()?;
        }
        Cmd::Usage { path } => {
            let store = DiskStore::open(&path, DiskMode::Dynamic)?;
            let db = Database::open(store)?;
            let usage = db.usage()?;
            db.infodump()?;
            println!(
                "{path:?}: {} used of {} ({:.2}%)",
                fmt_size(usage.used),
                fmt_size(usage.size),
                usage.used as f64 / usage.size.max(1) as f64 * 100.0
            );
            println!(
                "{} live chunks ({}), {} free chunks ({})",
                usage.live_chunks,
                fmt_size(usage.live_bytes),
                usage.free_chunks,
                fmt_size(usage.free_bytes)
            );
        }
        Cmd::Add {
            path,
            name,
            location,
            line,
        } => {
            let session = Session::open(&with_database(&config_file, path))?;
            session.index(vec![Entry {
                name,
                location,
                line,
            }]);
            // the single job is done once the queue is empty
            while !session.wait_idle(std::time::Duration::from_secs(1)) {
                debug!("waiting for the indexer");
            }
            info!("{} names in the index", session.len()?);
            session.close()?;
        }
        Cmd::Find {
            path,
            prefix,
            limit,
        } => {
            let session = Session::open(&with_database(&config_file, path))?;
            let monitor = Monitor::new();
            match session.search(&prefix, limit, Policy::WaitUntilReady, &monitor)? {
                Some(hits) => {
                    for hit in &hits {
                        println!("{}\t{}:{}", hit.name, hit.location, hit.line);
                    }
                    info!("{} matches for {prefix:?}", hits.len());
                }
                None => warn!("search was canceled"),
            }
            session.close()?;
        }
        Cmd::Remove { path, name } => {
            let session = Session::open(&with_database(&config_file, path))?;
            if session.remove(&name)? {
                info!("removed {name:?}");
            } else {
                warn!("{name:?} is not in the index");
            }
            session.close()?;
        }
    }
    Ok(())
}

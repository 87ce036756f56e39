use std::{cell::RefCell, sync::Arc};

use clap::Parser;
use kdam::{Bar, BarExt, tqdm};
use memdex::{
    BuildOptions,
    BuildStatus,
    DataDir,
    Engine,
    EngineConfig,
    Error,
    IndexStrategy,
    Result,
    StateDb,
    config::{self, KEYS},
    mcp,
    search,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{BuildArgs, Cli, Command, ConfigAction, SearchArgs};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("MEMDEX_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;

    match cli.command {
        Command::Build(args) => cmd_build(&data_dir, &args)?,
        Command::Search(args) => cmd_search(&data_dir, &args)?,
        Command::Status(args) => cmd_status(&data_dir, args.json)?,
        Command::Reset => {
            Engine::open(&data_dir, IndexStrategy::Embedding)?.reset()?;
            println!("Removed all build progress and batch files.");
        }
        Command::Config { action } => match action {
            ConfigAction::Show { json } => config_show(&data_dir, json)?,
            ConfigAction::Set { key, value } => {
                config_set(&data_dir, &key, &value)?
            }
            ConfigAction::Clear { key } => config_clear(&data_dir, &key)?,
        },
        Command::Mcp => {
            let engine = Engine::open(&data_dir, IndexStrategy::Embedding)?;
            mcp::run_mcp(Arc::new(engine))?;
        }
        Command::Completions(_) => {}
    }

    Ok(())
}

/// Resolve stored settings, releasing the state database afterwards so
/// the engine can open it.
fn resolve_config(data_dir: &DataDir) -> Result<EngineConfig> {
    let state = StateDb::open(&data_dir.state_db())?;
    EngineConfig::resolve(&state)
}

fn strategy(statistical: bool) -> IndexStrategy {
    if statistical {
        IndexStrategy::Statistical
    } else {
        IndexStrategy::Embedding
    }
}

fn cmd_build(data_dir: &DataDir, args: &BuildArgs) -> Result<()> {
    let mut config = resolve_config(data_dir)?;
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(sub_batch_size) = args.sub_batch_size {
        config.sub_batch_size = sub_batch_size;
    }

    let engine =
        Engine::open_with(data_dir, config, strategy(args.statistical))?;

    let bar = RefCell::new(tqdm!(desc = "Building", unit = " batch"));
    let observer =
        |status: &BuildStatus| advance_bar(&mut bar.borrow_mut(), status);
    let status = engine.load_corpus_with(
        &args.corpus,
        BuildOptions {
            max_batches: args.max_batches,
            on_progress: Some(&observer),
        },
    );
    if let Err(e) = bar.borrow_mut().refresh() {
        debug!(error = %e, "Could not draw progress bar");
    }
    eprintln!();
    let status = status?;

    eprintln!(
        "{} ({}%): {} batches, {} chunks, {} embeddings",
        status.status,
        status.percentage,
        status.batches_completed,
        status.chunks_processed,
        status.embeddings_created,
    );
    if args.statistical {
        eprintln!("Statistical indexes are kept in memory only.");
    }
    Ok(())
}

/// Move the build bar to `status`. Drawing failures are only logged.
fn advance_bar(bar: &mut Bar, status: &BuildStatus) {
    if status.total_batches > 0 {
        bar.total = status.total_batches as usize;
    }
    if let Err(e) = bar.update_to(status.batches_completed as usize) {
        debug!(error = %e, "Could not draw progress bar");
    }
}

fn cmd_search(data_dir: &DataDir, args: &SearchArgs) -> Result<()> {
    let engine = if args.statistical {
        let config = resolve_config(data_dir)?;
        let engine =
            Engine::open_with(data_dir, config, IndexStrategy::Statistical)?;
        if let Some(corpus) = &args.corpus {
            engine.load_corpus(corpus)?;
        }
        engine
    } else {
        Engine::open(data_dir, IndexStrategy::Embedding)?
    };

    if !engine.is_ready() {
        eprintln!("Index is not ready; run `memdex build <corpus>` first.");
    }

    let category = args.category.as_deref();
    if args.context {
        let block = engine.context_for_query(
            &args.query,
            args.count,
            category,
            args.max_chars,
        )?;
        print!("{block}");
        return Ok(());
    }

    let results = engine.retrieve(&args.query, args.count, category)?;
    if args.json {
        println!("{}", search::format_json(&results, &args.query)?);
    } else {
        search::format_human(&results);
    }
    Ok(())
}

fn cmd_status(data_dir: &DataDir, json: bool) -> Result<()> {
    let engine = Engine::open(data_dir, IndexStrategy::Embedding)?;
    let status = engine.build_status();

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Data directory: {}", data_dir.root().display());
    println!("Status: {} ({}%)", status.status, status.percentage);
    println!("Progress: {}", status.progress);
    println!(
        "Batches: {}/{}",
        status.batches_completed, status.total_batches
    );
    println!("Chunks: {}", status.chunks_processed);
    println!("Embeddings: {}", status.embeddings_created);
    println!("Ready: {}", if status.ready { "yes" } else { "no" });
    if let Some(error) = &status.error {
        println!("Error: {error}");
    }
    Ok(())
}

fn config_show(data_dir: &DataDir, json: bool) -> Result<()> {
    let state = StateDb::open(&data_dir.state_db())?;
    let resolved = EngineConfig::resolve(&state)?;

    let mut rows = Vec::with_capacity(KEYS.len());
    for key in KEYS {
        let source = if std::env::var(config::env_var_name(key)).is_ok() {
            "env"
        } else if state.get_setting(key)?.is_some() {
            "stored"
        } else {
            "default"
        };
        rows.push((*key, resolved.get(key).unwrap_or_default(), source));
    }

    if json {
        let map: serde_json::Map<String, serde_json::Value> = rows
            .into_iter()
            .map(|(key, value, source)| {
                (
                    key.to_string(),
                    serde_json::json!({ "value": value, "source": source }),
                )
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&map)?);
    } else {
        for (key, value, source) in rows {
            println!("{key} = {value} ({source})");
        }
    }
    Ok(())
}

fn config_set(data_dir: &DataDir, key: &str, value: &str) -> Result<()> {
    config::validate_setting(key, value)?;
    let state = StateDb::open(&data_dir.state_db())?;
    state.set_setting(key, value)?;
    println!("Set {key} = {value}");
    Ok(())
}

fn config_clear(data_dir: &DataDir, key: &str) -> Result<()> {
    let state = StateDb::open(&data_dir.state_db())?;
    if !state.remove_setting(key)? {
        return Err(Error::NotFound {
            kind: "setting",
            name: key.to_string(),
        });
    }
    println!("Cleared {key}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use memdex::status;

    use super::*;

    #[test]
    fn bar_follows_build_status() {
        let mut bar = tqdm!(desc = "Building", unit = " batch");
        let mut status = status::report(None, None, None, true);
        advance_bar(&mut bar, &status);
        assert_eq!(bar.counter, 0);

        status.total_batches = 4;
        status.batches_completed = 3;
        advance_bar(&mut bar, &status);
        assert_eq!(bar.total, 4);
        assert_eq!(bar.counter, 3);
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use itertools::Itertools;
use tracing::info;

use crate::config::{fix_config, Settings};
use crate::handle::{Blob, Expression, Fix, Object, Payload, Thunk, Value};
use crate::relater::Relater;
use crate::repository::Repository;
use crate::runner::NativeRunner;
use crate::storage::{Data, RuntimeStorage};

#[derive(Parser, Debug)]
#[clap(version)]
struct Cli {
    #[clap(flatten)]
    global: GlobalArgs,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Config file, defaults to `$FIX_CONFIG_FILE` or `~/.fix/fix.toml`
    #[clap(long, global = true, value_parser)]
    config: Option<Utf8PathBuf>,

    /// Directory holding the `.fix` repository
    #[clap(long, global = true, value_parser)]
    repo: Option<Utf8PathBuf>,

    /// Number of worker threads
    #[clap(long, global = true, value_parser)]
    threads: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Creates a repository in the given directory (defaults to the configured one)
    Init { dir: Option<Utf8PathBuf> },
    /// Stores a blob and prints its handle
    Blob { text: String },
    /// Points a label at a handle
    Label { name: String, reference: String },
    /// Lists all labels
    Labels,
    /// Prints what a handle refers to
    Show { reference: String },
    /// Runs a built-in procedure on integer arguments and stores the result
    Apply(ApplyArgs),
}

#[derive(Args, Debug)]
struct ApplyArgs {
    /// One of the built-in procedures, e.g. `add` or `fib`
    procedure: String,

    args: Vec<u64>,

    /// Also label the result
    #[clap(long, value_parser)]
    label: Option<String>,
}

impl GlobalArgs {
    fn settings(&self) -> &'static Settings {
        let mut overrides = HashMap::new();
        if let Some(repo) = &self.repo {
            overrides.insert("repository_dir", repo.to_string());
        }
        if let Some(threads) = self.threads {
            overrides.insert("threads", threads.to_string());
        }
        fix_config(self.config.as_ref(), Some(&overrides))
    }
}

fn open(settings: &Settings) -> Result<Repository> {
    Repository::find(&settings.repository_dir)
        .with_context(|| format!("no repository at or above {}", settings.repository_dir))
}

fn relater(settings: &Settings, repository: Repository) -> Result<Relater> {
    let storage = Arc::new(RuntimeStorage::new(settings.table_capacity));
    Ok(Relater::new(
        storage,
        Arc::new(NativeRunner::with_builtins()),
        settings.threads,
        Some(repository),
    )?)
}

fn hex(handle: &Fix) -> String {
    handle.to_raw().to_hex()
}

/// Integers for short blobs, then text if it's printable
fn describe_blob(bytes: &[u8]) -> String {
    let text = std::str::from_utf8(bytes)
        .ok()
        .filter(|text| !text.chars().any(char::is_control));
    if bytes.len() <= 8 {
        let mut buf = [0; 8];
        buf[..bytes.len()].copy_from_slice(bytes);
        let n = u64::from_le_bytes(buf);
        return match text {
            Some(text) => format!("{n} ({} bytes) {text:?}", bytes.len()),
            None => format!("{n} ({} bytes)", bytes.len()),
        };
    }
    match text {
        Some(text) => format!("{text:?}"),
        None => format!("{} bytes", bytes.len()),
    }
}

fn show(repository: &Repository, handle: Fix) -> Result<()> {
    println!("{handle}");
    println!("{}", hex(&handle));
    let Some(data) = repository.get(&handle)? else {
        bail!("{handle} is not stored in {}", repository.path());
    };
    match data {
        Data::Blob(bytes) => println!("{}", describe_blob(&bytes)),
        Data::Tree(elements) => {
            for (i, element) in elements.iter().enumerate() {
                println!("  {i}: {element}");
            }
        }
        Data::Object(result) => {
            let result = Fix::from(result);
            println!("=> {result}");
            if let Payload::Blob(Blob::Literal(l)) = result.payload() {
                println!("=> {}", describe_blob(l.as_bytes()));
            }
        }
    }
    Ok(())
}

impl ApplyArgs {
    fn run(&self, settings: &Settings) -> Result<()> {
        let repository = open(settings)?;
        let relater = relater(settings, repository.clone())?;
        let storage = relater.storage();
        let procedure = Blob::literal(self.procedure.as_bytes())
            .with_context(|| format!("no procedure is called {}", self.procedure))?;
        let mut elements = vec![Expression::Object(Object::Value(Value::Blob(procedure)))];
        elements.extend(
            self.args
                .iter()
                .map(|n| Expression::Object(Object::Value(Value::Blob(Blob::from_u64(*n))))),
        );
        let thunk = Object::Thunk(Thunk::Application(
            storage.create_expression_tree(&elements)?,
        ));
        info!("applying {}({})", self.procedure, self.args.iter().join(", "));
        let value = relater
            .evaluate(thunk)
            .with_context(|| format!("failed to apply {}", self.procedure))?;
        let written = repository.persist_results(storage)?;
        info!("stored {written} relations");
        let result = repository.persist(storage, value.into())?;
        if let Some(label) = &self.label {
            repository.set_label(label, result)?;
        }
        println!("{result}");
        println!("{}", hex(&result));
        if let Some(Data::Blob(bytes)) = storage.get(&result) {
            println!("{}", describe_blob(&bytes));
        }
        Ok(())
    }
}

impl Command {
    fn run(self, settings: &Settings) -> Result<()> {
        match self {
            Command::Init { dir } => {
                let dir = dir.unwrap_or_else(|| settings.repository_dir.clone());
                let repository = Repository::init(&dir)?;
                println!("initialized {}", repository.path());
            }
            Command::Blob { text } => {
                let repository = open(settings)?;
                let storage = RuntimeStorage::new(settings.table_capacity);
                let blob = storage.create_blob(text.as_bytes())?;
                let handle = repository.persist(&storage, Value::Blob(blob).into())?;
                println!("{}", hex(&handle));
            }
            Command::Label { name, reference } => {
                let repository = open(settings)?;
                let handle = repository.resolve(&reference)?;
                repository.set_label(&name, handle)?;
                println!("{name} -> {}", hex(&handle));
            }
            Command::Labels => {
                let repository = open(settings)?;
                for (name, handle) in repository.labels()? {
                    println!("{name} {} {handle}", hex(&handle));
                }
            }
            Command::Show { reference } => {
                let repository = open(settings)?;
                let handle = repository.resolve(&reference)?;
                show(&repository, handle)?;
            }
            Command::Apply(args) => args.run(settings)?,
        }
        Ok(())
    }
}

/// Parses CLI arguments and continues the program flow accordingly
pub fn parse_and_run() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.global.settings();
    cli.command.run(settings)
}

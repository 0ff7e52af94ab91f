use std::fs;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use esgf_harvest::app::{App, replay_signals};
use esgf_harvest::config::{ConfigLoader, ResolvedConfig};
use esgf_harvest::domain::parse_query_file;
use esgf_harvest::error::{ErrorClass, HarvestError};
use esgf_harvest::output::JsonOutput;
use esgf_harvest::record::AttachedParameters;
use esgf_harvest::report::{FileListWriter, dedup_file_list};
use esgf_harvest::search::{EsgfHttpClient, Searcher};
use esgf_harvest::selection::SelectionTree;
use esgf_harvest::store::StoreKind;
use esgf_harvest::transition::Signal;

#[derive(Parser)]
#[command(name = "esgf-harvest")]
#[command(about = "Harvest ESGF search metadata and drive post-processing pipelines")]
#[command(version, author)]
struct Cli {
    /// JSON config file (default: ./esgf-harvest.json when present)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Build a CSV list of files for a file of search queries")]
    FileList(FileListArgs),
    #[command(about = "Keep the latest version of each file in a file list")]
    Dedup(DedupArgs),
    #[command(about = "Print the queries a selection file expands to")]
    Selection(SelectionArgs),
    #[command(about = "Replay pipeline signals from a JSON lines file")]
    Events(EventsArgs),
}

#[derive(Args)]
struct FileListArgs {
    query_file: Utf8PathBuf,
    output_csv: Utf8PathBuf,

    /// Keep intermediate records on disk instead of in memory
    #[arg(long)]
    lowmem: bool,

    /// Parameter carried with every file record (KEY=VALUE)
    #[arg(long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,
}

#[derive(Args)]
struct DedupArgs {
    input_csv: Utf8PathBuf,
    output_csv: Utf8PathBuf,
}

#[derive(Args)]
struct SelectionArgs {
    selection_file: Utf8PathBuf,

    /// Selection the file is nested under
    #[arg(long = "default")]
    default_file: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct EventsArgs {
    events_file: Utf8PathBuf,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<HarvestError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &HarvestError) -> u8 {
    match error.class() {
        ErrorClass::Configuration => 2,
        ErrorClass::Query => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::FileList(args) => run_file_list(args, config),
        Commands::Dedup(args) => run_dedup(args),
        Commands::Selection(args) => run_selection(args),
        Commands::Events(args) => run_events(args, config),
    }
}

fn run_file_list(args: FileListArgs, config: ResolvedConfig) -> miette::Result<()> {
    let content = read_file(&args.query_file)?;
    let queries = parse_query_file(&content)?;
    let attached = parse_params(&args.params)?;

    let store_kind = if args.lowmem {
        StoreKind::Sqlite
    } else {
        config.store_kind
    };
    let client = EsgfHttpClient::new(config.timeout)?;
    let app = App::new(
        Searcher::new(client, config.search),
        config.data_dir,
        store_kind,
    );

    let mut writer = FileListWriter::create(&args.output_csv)?;
    let result = app.build_file_list(&queries, &attached, &mut writer, &JsonOutput)?;
    writer.finish()?;
    info!(files = result.files, output = %args.output_csv, "file list written");
    JsonOutput::print_file_list(&result).into_diagnostic()?;
    Ok(())
}

fn run_dedup(args: DedupArgs) -> miette::Result<()> {
    let summary = dedup_file_list(&args.input_csv, &args.output_csv)?;
    JsonOutput::print_dedup(&summary).into_diagnostic()?;
    Ok(())
}

fn run_selection(args: SelectionArgs) -> miette::Result<()> {
    let mut tree = SelectionTree::new();
    let parent = match &args.default_file {
        Some(path) => Some(tree.load_selection(None, Some(path.as_str()), &read_file(path)?)?),
        None => None,
    };
    let content = read_file(&args.selection_file)?;
    let id = tree.load_selection(parent, Some(args.selection_file.as_str()), &content)?;
    JsonOutput::print_selection(&tree.merge_facets(id)).into_diagnostic()?;
    Ok(())
}

fn run_events(args: EventsArgs, config: ResolvedConfig) -> miette::Result<()> {
    let content = read_file(&args.events_file)?;
    let signals = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str::<Signal>(line)
                .map_err(|err| HarvestError::InvalidQuery(format!("{line}: {err}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let result = replay_signals(config.pipelines, signals, &JsonOutput)?;
    JsonOutput::print_replay(&result).into_diagnostic()?;
    Ok(())
}

fn parse_params(raw: &[String]) -> Result<AttachedParameters, HarvestError> {
    raw.iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .ok_or_else(|| HarvestError::InvalidQuery(format!("expected KEY=VALUE, got {pair}")))?;
            Ok((key.to_string(), Value::String(value.to_string())))
        })
        .collect()
}

fn read_file(path: &Utf8PathBuf) -> Result<String, HarvestError> {
    fs::read_to_string(path.as_std_path())
        .map_err(|err| HarvestError::Filesystem(format!("{path}: {err}")))
}

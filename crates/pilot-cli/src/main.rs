//! `patchpilot` - drive a migration against scripted collaborators

mod render;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use pilot_core::collaborators::scripted::Fixture;
use pilot_core::{AnalysisDepth, PilotConfig, PipelineController, ProjectSnapshot};
use pilot_trace::{JsonlSink, TraceRecorder};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn cli() -> Command {
    Command::new("patchpilot")
        .version(pilot_core::VERSION)
        .about("Autonomous library-migration orchestration")
        .subcommand_required(true)
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON on stderr"),
        )
        .subcommand(
            Command::new("run")
                .about("Run a migration with collaborators scripted by a fixture")
                .arg(
                    Arg::new("fixture")
                        .long("fixture")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Fixture TOML describing targets, knowledge, patches and checks"),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_parser(value_parser!(PathBuf))
                        .help("Configuration TOML (defaults apply otherwise)"),
                )
                .arg(
                    Arg::new("project")
                        .long("project")
                        .value_parser(value_parser!(PathBuf))
                        .help("Project directory to snapshot"),
                )
                .arg(
                    Arg::new("trace-log")
                        .long("trace-log")
                        .value_parser(value_parser!(PathBuf))
                        .help("Append the trace to a JSON lines file"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("scan")
                .about("Print the ingestion inventory of a project")
                .arg(
                    Arg::new("project")
                        .long("project")
                        .default_value(".")
                        .value_parser(value_parser!(PathBuf))
                        .help("Project directory"),
                )
                .arg(
                    Arg::new("depth")
                        .long("depth")
                        .default_value("quick")
                        .value_parser(|s: &str| s.parse::<AnalysisDepth>())
                        .help("quick, deep or security"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(Command::new("config").about("Print the default configuration"))
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

async fn run(args: &ArgMatches) -> Result<i32> {
    let config = match args.get_one::<PathBuf>("config") {
        Some(path) => PilotConfig::load(path)?,
        None => PilotConfig::default(),
    };
    let fixture_path = args
        .get_one::<PathBuf>("fixture")
        .context("--fixture is required")?;
    let scripted = Fixture::load(fixture_path)?.into_scripted();

    let snapshot = match args.get_one::<PathBuf>("project") {
        Some(dir) => ProjectSnapshot::scan(dir, config.analysis_depth)
            .with_context(|| format!("scanning {}", dir.display()))?,
        None => ProjectSnapshot::new(".", config.analysis_depth),
    };

    let trace = match args.get_one::<PathBuf>("trace-log") {
        Some(path) => TraceRecorder::with_sink(Box::new(
            JsonlSink::open(path).with_context(|| format!("opening {}", path.display()))?,
        )),
        None => TraceRecorder::new(),
    };
    let controller = PipelineController::with_trace(config, scripted.collaborators(), trace)?;

    let report = controller.run(&snapshot).await.context("migration run failed")?;
    tracing::info!(
        completed = report.completed().len(),
        failed = report.failed().len(),
        "migration run finished"
    );
    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&render::json_report(&controller, &report))?);
    } else {
        print!("{}", render::text_report(&controller, &report));
    }
    Ok(if report.is_success() { 0 } else { 2 })
}

fn scan(args: &ArgMatches) -> Result<i32> {
    let dir = args.get_one::<PathBuf>("project").context("--project is required")?;
    let depth = args
        .get_one::<AnalysisDepth>("depth")
        .copied()
        .unwrap_or_default();
    let snapshot = ProjectSnapshot::scan(dir, depth).with_context(|| format!("scanning {}", dir.display()))?;
    let inventory = snapshot.inventory();

    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&inventory)?);
    } else {
        print!("{}", render::inventory(&snapshot, &inventory));
    }
    Ok(0)
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    init_logging(matches.get_flag("log-json"));

    let code = match matches.subcommand() {
        Some(("run", args)) => run(args).await?,
        Some(("scan", args)) => scan(args)?,
        Some(("config", _)) => {
            print!("{}", PilotConfig::default().to_toml_string()?);
            0
        }
        _ => 0,
    };
    std::process::exit(code);
}

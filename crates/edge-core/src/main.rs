//! `edge-runner` command line.

use clap::{Args, Parser, Subcommand, ValueEnum};
use edge_common::{Error, HeaderMap, RequestRecord, ResponseRecord, Result};
use edge_config::{resolve_config, ConfigPaths, RunnerConfig};
use edge_core::exit_codes::ExitCode;
use edge_core::logging::{self, LogFormat};
use edge_core::registry::{self, RegistrySettings};
use edge_core::{
    DirectoryProbe, EdgeRunner, RequestOutcome, RequestResolution, RequestRun, ResponseOutcome,
};
use serde_json::json;
use std::path::PathBuf;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(
    name = "edge-runner",
    version,
    about = "Run edge function plugins against requests and responses"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalOpts {
    /// Config file (default: $EDGE_RUNNER_CONFIG, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Plugin file or directory
    #[arg(long, global = true)]
    plugins: Option<PathBuf>,

    /// KEY=value file of bake substitutions
    #[arg(long, global = true)]
    bake_file: Option<PathBuf>,

    /// KEY=value file of allow-listed environment names
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the plugins and print the stage map
    Check,

    /// Run the request-side stages for one request
    Request(RequestArgs),

    /// Run both sides and print the final response headers
    Response(ResponseArgs),

    /// Write baked plugin sources without running them
    Bake {
        /// Output file, or directory for a plugin directory
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RequestArgs {
    /// Request target, e.g. `/page?a=1`
    #[arg(long, default_value = "/")]
    uri: String,

    #[arg(long, default_value = "GET")]
    method: String,

    /// Request header as `Name: value` (repeatable)
    #[arg(long = "header", short = 'H')]
    headers: Vec<String>,

    #[arg(long, default_value = "127.0.0.1")]
    client_ip: String,

    /// Document root; a rewritten path that does not exist there falls back to the original
    #[arg(long)]
    root: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ResponseArgs {
    #[command(flatten)]
    request: RequestArgs,

    /// Status the origin answered with
    #[arg(long, default_value_t = 200)]
    status: u16,

    /// Origin response header as `Name: value` (repeatable)
    #[arg(long = "response-header")]
    response_headers: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    let log_format = match cli.global.format {
        OutputFormat::Text => LogFormat::Text,
        OutputFormat::Json => LogFormat::Json,
    };
    logging::init_logging(log_format, cli.global.verbose);

    let code = match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            report_error(cli.global.format, &err);
            ExitCode::for_error(&err)
        }
    };
    std::process::exit(code.as_i32());
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let config = load_config(&cli.global)?;
    match &cli.command {
        Command::Check => run_check(&config, cli.global.format),
        Command::Request(args) => run_request(&config, args, cli.global.format),
        Command::Response(args) => run_response(&config, args, cli.global.format),
        Command::Bake { out } => run_bake(&config, out, cli.global.format),
    }
}

fn load_config(global: &GlobalOpts) -> Result<RunnerConfig> {
    let resolved = resolve_config(&ConfigPaths::discover(global.config.clone()))?;
    debug!(source = ?resolved.source, "configuration resolved");
    let mut config = resolved.config;
    if let Some(path) = &global.plugins {
        config.plugins = Some(path.clone());
    }
    if let Some(path) = &global.bake_file {
        config.bake_file = Some(path.clone());
    }
    if let Some(path) = &global.env_file {
        config.env_file = Some(path.clone());
    }
    // Every command is one-shot; `[watch]` only matters to embedders.
    config.watch.enabled = false;

    let validation = config.validate();
    if let Some(first) = validation.errors.first() {
        return Err(Error::Config(first.to_string()));
    }
    Ok(config)
}

fn parse_headers(raw: &[String]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for item in raw {
        let (name, value) = item
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("header must be 'Name: value', got '{item}'")))?;
        headers.append(name.trim(), value.trim());
    }
    Ok(headers)
}

fn build_request(args: &RequestArgs) -> Result<RequestRecord> {
    let mut headers = parse_headers(&args.headers)?;
    if !headers.contains("host") {
        headers.insert("Host", "localhost");
    }
    Ok(RequestRecord::from_target(args.method.to_ascii_uppercase(), &args.uri)
        .with_headers(headers)
        .with_client_ip(args.client_ip.clone()))
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn report_error(format: OutputFormat, err: &Error) {
    match format {
        OutputFormat::Text => eprintln!("edge-runner: {err}"),
        OutputFormat::Json => {
            let body = json!({ "error": { "code": err.code(), "message": err.to_string() } });
            println!("{body}");
        }
    }
}

fn run_check(config: &RunnerConfig, format: OutputFormat) -> Result<ExitCode> {
    let runner = EdgeRunner::start(config)?;
    let report = runner.report();

    match format {
        OutputFormat::Json => print_json(&serde_json::to_value(&*report)?)?,
        OutputFormat::Text => {
            println!("{} module(s) bound", report.loaded.len());
            for module in &report.loaded {
                println!(
                    "  {:<16} {}  sha256:{}",
                    module.stage.as_str(),
                    module.path.display(),
                    &module.fingerprint[..12]
                );
            }
            for skipped in &report.skipped {
                println!("  skipped {}: {}", skipped.path.display(), skipped.reason);
            }
            for failed in &report.failed {
                println!("  failed  {}: {}", failed.path.display(), failed.error);
            }
        }
    }
    Ok(ExitCode::Clean)
}

fn print_request_outcome(
    outcome: &RequestOutcome,
    served: Option<&str>,
    format: OutputFormat,
) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let mut value = serde_json::to_value(outcome)?;
            if let Some(path) = served {
                value["serve"] = json!(path);
            }
            print_json(&value)
        }
        OutputFormat::Text => {
            match outcome {
                RequestOutcome::ShortCircuit {
                    status,
                    status_description,
                    headers,
                    body,
                    ..
                } => {
                    println!("{status} {status_description}");
                    for (name, value) in headers.flatten() {
                        println!("{name}: {value}");
                    }
                    if let Some(body) = body {
                        println!();
                        println!("{body}");
                    }
                }
                RequestOutcome::Forward { path, .. } => println!("{}", served.unwrap_or(path)),
            }
            Ok(())
        }
    }
}

fn run_request(config: &RunnerConfig, args: &RequestArgs, format: OutputFormat) -> Result<ExitCode> {
    let runner = EdgeRunner::start(config)?;
    let request = build_request(args)?;
    let original = request.addressable_path();
    let outcome = runner.request_outcome(request);

    let served = args
        .root
        .as_ref()
        .and_then(|root| outcome.serve_path(&original, &DirectoryProbe::new(root)));
    print_request_outcome(&outcome, served.as_deref(), format)?;

    Ok(match outcome {
        RequestOutcome::ShortCircuit { .. } => ExitCode::ShortCircuited,
        RequestOutcome::Forward { .. } => ExitCode::Clean,
    })
}

fn run_response(config: &RunnerConfig, args: &ResponseArgs, format: OutputFormat) -> Result<ExitCode> {
    let runner = EdgeRunner::start(config)?;
    let request = build_request(&args.request)?;
    let run = runner.handle_request(request);

    let forwarded = match run.resolution {
        RequestResolution::Forward { request, .. } => request,
        resolution @ RequestResolution::ShortCircuit { .. } => {
            let outcome = RequestOutcome::from(RequestRun { resolution, ..run });
            print_request_outcome(&outcome, None, format)?;
            return Ok(ExitCode::ShortCircuited);
        }
    };

    if !(100..=599).contains(&args.status) {
        return Err(Error::Config(format!("invalid status code {}", args.status)));
    }
    let origin = ResponseRecord::new(args.status, parse_headers(&args.response_headers)?);
    let outcome: ResponseOutcome = runner.response_outcome(&forwarded, origin);

    match format {
        OutputFormat::Json => print_json(&serde_json::to_value(&outcome)?)?,
        OutputFormat::Text => {
            println!("{} {}", outcome.status, outcome.status_description);
            for (name, value) in &outcome.headers {
                println!("{name}: {value}");
            }
        }
    }
    Ok(ExitCode::Clean)
}

fn run_bake(config: &RunnerConfig, out: &std::path::Path, format: OutputFormat) -> Result<ExitCode> {
    let settings = RegistrySettings::from_config(config)?;
    let written = registry::bake_plugins(&settings, out)?;
    match format {
        OutputFormat::Json => print_json(&json!({ "written": written }))?,
        OutputFormat::Text => {
            for path in &written {
                println!("{}", path.display());
            }
        }
    }
    Ok(ExitCode::Clean)
}

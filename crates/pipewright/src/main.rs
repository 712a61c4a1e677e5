//! pipewright CLI entry point.
//!
//! Usage:
//!   pipewright 'seq 1 10' 'grep 1'               # seq 1 10 | grep 1
//!   pipewright -j 4 --each 'wc -c' 'ls'          # wc -c <line> for each line of ls
//!
//! Each stage is one argument, split on whitespace (no quoting).

use std::env;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pipewright_kernel::{ConcurrencyOptions, Enumerable, Host, PipelineError, ProcessSpec, RuntimeConfig};

fn main() -> ExitCode {
    // Initialize tracing (respects RUST_LOG env var); stdout is for data
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:?}");
            exit_code_for(&e)
        }
    }
}

#[derive(Debug, Default)]
struct Options {
    concurrency: Option<usize>,
    each: Option<String>,
    unordered: bool,
    stages: Vec<String>,
}

fn run() -> Result<ExitCode> {
    let args: Vec<String> = env::args().skip(1).collect();
    let mut opts = Options::default();

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                print_help();
                return Ok(ExitCode::SUCCESS);
            }
            "--version" | "-V" => {
                println!("pipewright {}", env!("CARGO_PKG_VERSION"));
                return Ok(ExitCode::SUCCESS);
            }
            "-j" | "--jobs" => {
                let n = iter.next().context("-j requires a number")?;
                opts.concurrency = Some(n.parse().with_context(|| format!("invalid job count: {n}"))?);
            }
            "--each" => {
                opts.each = Some(iter.next().context("--each requires a command")?);
            }
            "--unordered" => opts.unordered = true,
            unknown if unknown.starts_with('-') && unknown.len() > 1 => {
                eprintln!("Unknown option: {unknown}");
                eprintln!("Run 'pipewright --help' for usage.");
                return Ok(ExitCode::FAILURE);
            }
            _ => opts.stages.push(arg),
        }
    }

    if opts.stages.is_empty() {
        print_help();
        return Ok(ExitCode::FAILURE);
    }

    let mut config = RuntimeConfig::from_env();
    if let Some(n) = opts.concurrency {
        config = config.with_concurrency(n);
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_pipeline(config, opts))?;
    Ok(ExitCode::SUCCESS)
}

async fn run_pipeline(config: RuntimeConfig, opts: Options) -> Result<()> {
    let host = Host::new(config);
    let _signals = host.arena().close_on_shutdown();

    let mut seq: Option<Enumerable<Vec<u8>>> = None;
    for stage in &opts.stages {
        let spec = parse_stage(stage)?;
        seq = Some(match seq {
            None => host.exec(spec),
            Some(upstream) => host.exec(spec).stdin(upstream),
        }
        .stream());
    }
    let Some(seq) = seq else {
        bail!("no stages given");
    };

    let lines = seq.text_lines();
    let lines = match &opts.each {
        Some(each) => fan_out(&host, lines, each, opts.unordered)?,
        None => lines,
    };
    print_lines(lines).await?;
    Ok(())
}

/// Run `each <line>` for every line, `host.concurrency()` at a time.
fn fan_out(host: &Host, lines: Enumerable<String>, each: &str, unordered: bool) -> Result<Enumerable<String>> {
    let template = parse_stage(each)?;
    let group = host.new_group();
    let options: ConcurrencyOptions = host.concurrency();
    tracing::debug!(concurrency = options.concurrency.get(), unordered, "fanning out");

    let worker = move |line: String| {
        let exec = group.exec(template.clone().arg(line));
        async move { exec.run_text().await }
    };
    let outputs = if unordered {
        lines.concurrent_unordered_map(options, worker)
    } else {
        lines.concurrent_map(options, worker)
    };
    Ok(outputs.flat_map(|text| text.lines().map(str::to_string).collect::<Vec<_>>()))
}

async fn print_lines(mut lines: Enumerable<String>) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next().await {
        let mut line = line?;
        line.push('\n');
        if let Err(e) = stdout.write_all(line.as_bytes()).await {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                // Reader went away (e.g. `| head`); dropping `lines` tears down.
                return Ok(());
            }
            return Err(e.into());
        }
    }
    stdout.flush().await?;
    Ok(())
}

fn parse_stage(stage: &str) -> Result<ProcessSpec> {
    ProcessSpec::from_argv(stage.split_whitespace()).with_context(|| format!("empty stage: {stage:?}"))
}

/// Exit with the failing process's code where there is one.
fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    err.downcast_ref::<PipelineError>()
        .and_then(|e| e.root_cause().exit_code())
        .and_then(|code| u8::try_from(code).ok())
        .filter(|code| *code != 0)
        .map(ExitCode::from)
        .unwrap_or(ExitCode::FAILURE)
}

fn print_help() {
    println!(
        r#"pipewright v{}

Usage:
  pipewright [OPTIONS] <stage> [<stage>...]

Each stage is one argument holding a command and its arguments, split on
whitespace. Stages are piped together and the last stage's stdout is printed.

Options:
  -j, --jobs <n>               Concurrency for --each (default: CPU count)
  --each <command>             Run <command> <line> for each output line
  --unordered                  With --each, print results as they finish
  -h, --help                   Show this help
  -V, --version                Show version

Environment:
  PIPEWRIGHT_CONCURRENCY       Default concurrency
  PIPEWRIGHT_KILL_GRACE_MS     SIGTERM-to-SIGKILL grace on teardown
  PIPEWRIGHT_STDERR_TAIL       Stderr lines kept for error messages
  RUST_LOG                     Log filter (e.g. pipewright_kernel=debug)

Examples:
  pipewright 'seq 1 100' 'grep 7'
  pipewright -j 8 --each 'sha256sum' 'find . -type f'
"#,
        env!("CARGO_PKG_VERSION")
    );
}

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use container_attach::terminal::spawn_stdin_reader;
#[cfg(unix)]
use container_attach::terminal::TerminalGuard;
use container_attach::{
    AttachOptions, AttachOutcome, BerthConfig, ClientStreams, DetachKeys, RunOptions, RunOutcome,
    Runtime,
};
use container_lifecycle::{Container, ContainerConfig, ProcessSpec, StopSignal};

#[derive(Parser)]
#[command(name = "berth")]
#[command(about = "Run a process as a container and attach to its terminal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ~/.berth/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a container, start it and attach to it
    Run(RunArgs),
}

#[derive(Parser)]
struct RunArgs {
    /// Keep stdin attached
    #[arg(short, long)]
    interactive: bool,

    /// Run the process on a pseudo-terminal
    #[arg(short, long)]
    tty: bool,

    /// Start in the background and print the container id
    #[arg(short, long)]
    detach: bool,

    /// Remove the container when it exits
    #[arg(long)]
    rm: bool,

    /// Container name
    #[arg(long)]
    name: Option<String>,

    /// Detach sequence, e.g. "ctrl-p,ctrl-q"
    #[arg(long)]
    detach_keys: Option<String>,

    /// Working directory of the process
    #[arg(short, long)]
    workdir: Option<PathBuf>,

    /// Environment variables (KEY=VALUE)
    #[arg(short, long = "env")]
    env: Vec<String>,

    /// Command and arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = BerthConfig::load(&config_path)?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log.filter));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    match cli.command {
        Commands::Run(args) => {
            let code = run_command(&config, args).await?;
            std::process::exit(code);
        }
    }
}

fn default_config_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(".berth")
        .join("config.toml")
}

fn parse_env(vars: &[String]) -> Result<Vec<(String, String)>> {
    vars.iter()
        .map(|var| match var.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => bail!("Invalid environment variable {:?}, expected KEY=VALUE", var),
        })
        .collect()
}

async fn run_command(config: &BerthConfig, args: RunArgs) -> Result<i32> {
    let detach_keys = args
        .detach_keys
        .as_deref()
        .map(str::parse::<DetachKeys>)
        .transpose()?;

    let mut command = args.command.into_iter();
    let Some(program) = command.next() else {
        bail!("No command given");
    };
    let process = ProcessSpec {
        command: program,
        args: command.collect(),
        working_dir: args.workdir,
        env: parse_env(&args.env)?,
    };
    let container_config = ContainerConfig {
        name: args.name,
        process,
        tty: args.tty,
        stdin_once: args.interactive && !args.detach,
        auto_remove: args.rm,
    };

    let runtime = Runtime::from_config(config, Runtime::driver_for(config, args.tty));

    if args.detach {
        let outcome = runtime
            .run(
                container_config,
                RunOptions {
                    detach: true,
                    ..Default::default()
                },
                ClientStreams::new(),
            )
            .await?;
        if let RunOutcome::Background(id) = outcome {
            println!("{}", id);
        }
        return Ok(0);
    }

    #[cfg(unix)]
    let mut guard = TerminalGuard::new();
    #[cfg(unix)]
    if args.tty && args.interactive && guard.is_terminal() {
        if let Err(e) = guard.enter_raw_mode() {
            warn!("{:#}", e);
        }
    }

    let mut client = ClientStreams::new()
        .with_output(tokio::io::stdout())
        .with_error(tokio::io::stderr());
    let stdin_shutdown = if args.interactive {
        let (input, shutdown) = spawn_stdin_reader(config.runtime.read_buffer_size);
        client = client.with_input(input);
        Some(shutdown)
    } else {
        None
    };

    let options = RunOptions {
        attach: AttachOptions {
            stdin: args.interactive,
            stdout: true,
            stderr: true,
            tty: args.tty,
            detach_keys,
        },
        detach: false,
    };

    let run = runtime.run(container_config, options, client);
    tokio::pin!(run);
    let outcome = loop {
        tokio::select! {
            outcome = &mut run => break outcome?,
            _ = tokio::signal::ctrl_c() => {
                for container in runtime.registry().list() {
                    if let Err(e) = container.kill(StopSignal::Term) {
                        warn!("Failed to stop container {}: {}", container.id().short(), e);
                    }
                }
            }
        }
    };
    drop(stdin_shutdown);
    #[cfg(unix)]
    drop(guard);

    let RunOutcome::Foreground {
        container,
        outcome,
        exit_code,
    } = outcome
    else {
        return Ok(0);
    };

    match outcome {
        AttachOutcome::Exited => Ok(exit_code.unwrap_or(0)),
        AttachOutcome::Detached | AttachOutcome::Disconnected => {
            eprintln!(
                "\r\n[berth: {} from {}, waiting for it to exit]",
                outcome.as_str(),
                container.id().short()
            );
            supervise(&container).await
        }
        AttachOutcome::Faulted(e) => {
            Err(e).with_context(|| format!("Session on {} failed", container.id().short()))
        }
    }
}

/// Wait for a container this process still owns; Ctrl-C asks it to stop.
async fn supervise(container: &Arc<Container>) -> Result<i32> {
    loop {
        tokio::select! {
            code = container.wait_stop(None) => {
                let code = code?;
                info!("Container {} exited with {}", container.id().short(), code);
                return Ok(code);
            }
            _ = tokio::signal::ctrl_c() => {
                if let Err(e) = container.kill(StopSignal::Term) {
                    warn!("Failed to stop container {}: {}", container.id().short(), e);
                }
            }
        }
    }
}

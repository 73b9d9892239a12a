use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use doux_bridge_core::bridge::{EngineBridge, EngineSource};
use doux_bridge_core::osc::{OscListener, DEFAULT_OSC_PORT};
use doux_bridge_core::samples::{DefaultFetcher, SampleBanks};
use doux_bridge_core::{parse_path, BridgeConfig, Result, Session};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

mod repl;

use repl::{Input, LineAssembler};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Play {
            engine,
            seconds,
            path,
        } => run_play(engine, seconds, &path).await,
        Commands::Repl { engine } => run_repl(engine).await,
        Commands::Osc { engine, port } => run_osc(engine, port).await,
        Commands::Parse { path } => run_parse(&path),
        Commands::Banks { manifest, config } => run_banks(&manifest, config).await,
    }
}

async fn run_play(engine: EngineArgs, seconds: f64, path: &str) -> Result<()> {
    let running = start_session(&engine)?;
    let session = &running.session;
    session.wait_ready().await?;
    tracing::info!(sample_rate = session.bridge().sample_rate(), "engine ready");

    match session.play(path).await? {
        Some(message) => tracing::info!(command = %message.command, "sent"),
        None => tracing::warn!("nothing to play"),
    }

    tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
    session.hush().await
}

async fn run_repl(engine: EngineArgs) -> Result<()> {
    let running = start_session(&engine)?;
    let session = &running.session;
    session.wait_ready().await?;
    println!("ready, .help for commands");

    let mut clock = session.clock();
    let mut assembler = LineAssembler::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let input = match line {
            Some(line) => assembler.push(&line),
            None => match assembler.flush() {
                Some(input) => Some(input),
                None => break,
            },
        };
        let Some(input) = input else {
            continue;
        };

        let outcome = match input {
            Input::Path(path) => session.play(&path).await.map(|_| ()),
            Input::Hush => session.hush().await,
            Input::Panic => session.panic().await,
            Input::Resume => session.resume().await,
            Input::Time => {
                clock.poll();
                println!("{:.3}s", clock.now());
                Ok(())
            }
            Input::Help => {
                println!("{}", repl::HELP);
                Ok(())
            }
            Input::Quit => break,
            Input::Unknown(command) => {
                println!("unknown command .{command}");
                Ok(())
            }
        };
        if let Err(e) = outcome {
            tracing::error!(error = %e, "command failed");
        }
    }

    session.hush().await
}

async fn run_osc(engine: EngineArgs, port: u16) -> Result<()> {
    let running = start_session(&engine)?;
    let session = &running.session;
    session.wait_ready().await?;

    let mut listener = OscListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening for osc");

    loop {
        let events = tokio::select! {
            events = listener.recv() => events?,
            _ = tokio::signal::ctrl_c() => break,
        };
        for event in events {
            if let Err(e) = session.evaluate(event).await {
                tracing::error!(error = %e, "osc command failed");
            }
        }
    }

    session.hush().await
}

fn run_parse(path: &str) -> Result<()> {
    let event = parse_path(path);
    let json = serde_json::to_string_pretty(&event)
        .map_err(|e| doux_bridge_core::BridgeError::msg(format!("failed to print event: {e}")))?;
    println!("{json}");
    Ok(())
}

async fn run_banks(manifest: &str, config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config.as_ref())?;
    let fetcher = DefaultFetcher::new(Duration::from_secs(config.samples.fetch_timeout_secs))?;
    let banks = SampleBanks::new();
    let count = banks.load_manifest(&fetcher, manifest).await?;
    tracing::info!(count, "manifest loaded");
    for name in banks.names() {
        println!("{name}");
    }
    Ok(())
}

#[cfg(feature = "device")]
type Device = doux_bridge_core::bridge::DeviceStream;
#[cfg(not(feature = "device"))]
type Device = ();

/// Fields drop in order, so the render thread is joined before the device
/// stream it feeds is closed.
struct Running {
    session: Session,
    _device: Device,
}

fn start_session(args: &EngineArgs) -> Result<Running> {
    #[allow(unused_mut)]
    let mut config = load_config(args.config.as_ref())?;
    let source = if args.engine.starts_with("http://") || args.engine.starts_with("https://") {
        EngineSource::Url(args.engine.clone())
    } else {
        EngineSource::Path(PathBuf::from(&args.engine))
    };
    let builder = EngineBridge::builder(source);

    #[cfg(feature = "device")]
    let (builder, device) = {
        let (output, stream) = doux_bridge_core::bridge::DeviceOutput::open(
            config.audio.channels,
            config.audio.block_size,
        )?;
        config.audio.sample_rate = stream.sample_rate();
        (builder.output(output), stream)
    };
    #[cfg(not(feature = "device"))]
    let device = ();

    let session = Session::start(builder, &config)?;
    for dir in &args.sample_dir {
        session.register_sample_dir(dir)?;
    }
    for manifest in &args.samples {
        session.register_manifest(manifest.clone());
    }
    Ok(Running {
        session,
        _device: device,
    })
}

fn load_config(path: Option<&PathBuf>) -> Result<BridgeConfig> {
    match path {
        Some(path) => {
            tracing::info!(?path, "loading config");
            BridgeConfig::load(path)
        }
        None => Ok(BridgeConfig::default()),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Drive a doux engine from textual commands", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct EngineArgs {
    /// Compiled engine module, as a path or URL.
    #[arg(short, long)]
    engine: String,
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Sample manifests to register (URL, `github:user/repo` or `local:path`).
    #[arg(short, long)]
    samples: Vec<String>,
    /// Local sample folders; each subfolder becomes a bank.
    #[arg(long)]
    sample_dir: Vec<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play one command path and keep rendering for a while.
    Play {
        #[command(flatten)]
        engine: EngineArgs,
        /// How long to keep rendering before hushing.
        #[arg(long, default_value_t = 2.0)]
        seconds: f64,
        /// Command path, e.g. `/s/sine/freq/440`.
        path: String,
    },
    /// Read command paths from stdin.
    Repl {
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Evaluate OSC messages received over UDP.
    Osc {
        #[command(flatten)]
        engine: EngineArgs,
        #[arg(short, long, default_value_t = DEFAULT_OSC_PORT)]
        port: u16,
    },
    /// Print a command path as JSON.
    Parse { path: String },
    /// List the banks a manifest registers.
    Banks {
        manifest: String,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

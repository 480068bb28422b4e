use std::path::PathBuf;
use std::str::FromStr;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use llamalaunch::lifecycle::LifecycleState;
use llamalaunch::models::downloader::{DownloadOutcome, Downloader};
use llamalaunch::models::{self, find_variant, ModelDescriptor, ModelFamily, ModelStore};
use llamalaunch::{EngineSettings, LogEventSink, Orchestrator, ServerConfig};

#[derive(Parser)]
#[command(name = "llamalaunch", about = "Manage a local llama.cpp inference server")]
struct Cli {
    /// Directory holding downloaded model weights
    #[arg(long, default_value = "models")]
    models_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List catalog models and whether they are downloaded
    List,
    /// Download a model's weights
    Download {
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Delete a downloaded model
    Delete {
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Download/build as needed, then run the server until interrupted
    Serve {
        #[command(flatten)]
        model: ModelArgs,

        /// llama.cpp checkout with (or for) the server binary
        #[arg(long, default_value = "llama.cpp")]
        engine_dir: PathBuf,

        /// Force a rebuild even when the server binary exists
        #[arg(long)]
        rebuild: bool,

        #[arg(long, default_value_t = 8080)]
        port: u16,

        #[arg(long, default_value_t = 2048)]
        context_size: u32,

        #[arg(long, default_value_t = 8)]
        threads: u32,
    },
}

#[derive(clap::Args)]
struct ModelArgs {
    /// Model family: codellama, llama2 or mistral
    #[arg(long)]
    family: String,

    /// Parameter count in billions
    #[arg(long, default_value_t = 7)]
    size: u32,

    /// Quantization bit width
    #[arg(long, default_value_t = 4)]
    bits: u32,
}

impl ModelArgs {
    fn resolve(&self) -> Result<ModelDescriptor, String> {
        let family = ModelFamily::from_str(&self.family)
            .map_err(|_| format!("unknown model family '{}'", self.family))?;
        find_variant(family, self.size, self.bits).ok_or_else(|| {
            format!(
                "no catalog entry for {} {}B Q{}",
                family, self.size, self.bits
            )
        })
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let store = ModelStore::new(&cli.models_dir);

    let result = match cli.command {
        Command::List => list(&store),
        Command::Download { model } => download(&store, &model).await,
        Command::Delete { model } => delete(&store, &model),
        Command::Serve {
            model,
            engine_dir,
            rebuild,
            port,
            context_size,
            threads,
        } => {
            serve(
                &cli.models_dir,
                &model,
                engine_dir,
                rebuild,
                port,
                context_size,
                threads,
            )
            .await
        }
    };

    if let Err(message) = result {
        log::error!("{}", message);
        std::process::exit(1);
    }
}

fn list(store: &ModelStore) -> Result<(), String> {
    for info in models::list_models(store) {
        let status = if info.downloaded {
            "downloaded"
        } else if info.partial_bytes.is_some() {
            "partial"
        } else {
            "available"
        };
        println!(
            "{:<22} {:>6} MB RAM  [{}]",
            info.descriptor.display_name(),
            info.descriptor.estimated_ram_mb,
            status
        );
    }
    Ok(())
}

async fn download(store: &ModelStore, model: &ModelArgs) -> Result<(), String> {
    let descriptor = model.resolve()?;
    if store.exists(&descriptor) {
        println!("{} is already downloaded", descriptor.display_name());
        return Ok(());
    }

    let swept = store.sweep_partials().map_err(|e| e.to_string())?;
    for path in swept {
        log::info!("removed stale partial {:?}", path);
    }

    let (tx, rx) = mpsc::channel();
    let downloader = Downloader::new();
    let token = downloader
        .start(
            descriptor.clone(),
            store.clone(),
            Arc::new(LogEventSink),
            move |outcome| {
                let _ = tx.send(outcome);
            },
        )
        .map_err(|e| e.to_string())?;

    let recv = tokio::task::spawn_blocking(move || rx.recv());
    tokio::select! {
        outcome = recv => match outcome {
            Ok(Ok(DownloadOutcome::Success)) => {
                println!("{} downloaded", descriptor.display_name());
                Ok(())
            }
            Ok(Ok(DownloadOutcome::Failure(e))) => Err(e.to_string()),
            Ok(Ok(DownloadOutcome::Cancelled)) => Err("download cancelled".to_string()),
            _ => Err("download worker disappeared".to_string()),
        },
        _ = tokio::signal::ctrl_c() => {
            token.cancel();
            Err("download cancelled".to_string())
        }
    }
}

fn delete(store: &ModelStore, model: &ModelArgs) -> Result<(), String> {
    let descriptor = model.resolve()?;
    store.delete(&descriptor).map_err(|e| e.to_string())?;
    println!("{} deleted", descriptor.display_name());
    Ok(())
}

async fn serve(
    models_dir: &PathBuf,
    model: &ModelArgs,
    engine_dir: PathBuf,
    rebuild: bool,
    port: u16,
    context_size: u32,
    threads: u32,
) -> Result<(), String> {
    let descriptor = model.resolve()?;
    let config = ServerConfig::new(context_size, threads, port).map_err(|e| e.to_string())?;

    let mut engine = EngineSettings::new(engine_dir);
    engine.rebuild = rebuild;

    let orchestrator = Arc::new(Orchestrator::new(
        models_dir,
        engine,
        Arc::new(LogEventSink),
    ));
    orchestrator
        .store()
        .ensure_dir()
        .map_err(|e| e.to_string())?;

    orchestrator
        .start(descriptor, config)
        .map_err(|e| e.to_string())?;

    let mut stopping = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if stopping {
                    // Second interrupt: give up waiting
                    return Err("interrupted again before shutdown finished".to_string());
                }
                log::info!("interrupt received, stopping");
                orchestrator.stop();
                stopping = true;
            }
            _ = tokio::time::sleep(Duration::from_millis(250)) => {
                match orchestrator.state() {
                    LifecycleState::Idle => return Ok(()),
                    LifecycleState::Failed { reason } => return Err(reason),
                    _ => {}
                }
            }
        }
    }
}

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use bgi_rt::{
    config::{ENV_SESSION, SessionConfig, SpawnWord},
    display, logging,
    names::Namespace,
    registry::{Registry, ShmRegistry},
    server::headless::{self, Capture},
};
use clap::Parser;

/// Display server for a bgi-rt session. Normally started by the client.
#[derive(Debug, Parser)]
#[command(name = "bgi-server", version)]
struct Args {
    /// Run without a window; input only arrives through the shared state.
    #[arg(long)]
    headless: bool,

    /// Session config as JSON.
    #[arg(long, env = ENV_SESSION, hide_env_values = true)]
    session: Option<String>,

    /// Legacy packed word: width in bits 0-11, height 12-23, mode 24-35.
    #[arg(long, conflicts_with = "session")]
    spawn_word: Option<u64>,

    #[arg(long)]
    namespace: Option<String>,

    /// Directory holding the lease files.
    #[arg(long)]
    runtime_dir: Option<PathBuf>,
}

fn session_config(args: &Args) -> bgi_rt::Result<SessionConfig> {
    let mut config = match (&args.session, args.spawn_word) {
        (_, Some(word)) => SessionConfig::from_spawn_word(SpawnWord(word))?,
        (Some(json), None) => SessionConfig::from_env_value(json)?,
        (None, None) => {
            return Err(bgi_rt::Error::InvalidConfig(format!(
                "no session: pass --session, --spawn-word or set {ENV_SESSION}"
            )));
        }
    };
    if let Some(namespace) = &args.namespace {
        config = config.with_namespace(Namespace::new(namespace.as_str())?);
    }
    if let Some(dir) = &args.runtime_dir {
        config = config.with_runtime_dir(dir);
    }
    Ok(config)
}

fn main() -> ExitCode {
    logging::init();
    let args = Args::parse();

    let config = match session_config(&args) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "bad session config");
            return ExitCode::from(2);
        }
    };
    let registry: Arc<dyn Registry> = Arc::new(ShmRegistry::for_config(&config));

    let result = if args.headless {
        let (injector, events) = headless::channel();
        headless::serve(registry, config, injector, events, Capture::new())
            .map_err(|err| err.to_string())
    } else {
        display::run(registry, config, false).map_err(|err| err.to_string())
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "server failed");
            ExitCode::FAILURE
        }
    }
}

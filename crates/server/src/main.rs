mod config;
mod node;
mod simulation;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use config::NodeConfig;

#[derive(Parser)]
#[command(name = "strata-server")]
#[command(about = "Replicates a small simulated scene, or follows one as a client")]
struct Args {
    /// TOML file with node settings; flags override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    bind: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Join the server at this address instead of hosting.
    #[arg(long)]
    connect: Option<String>,

    #[arg(short, long)]
    tick_rate: Option<u32>,

    #[arg(short, long)]
    sync_rate: Option<u32>,

    #[arg(short, long)]
    objects: Option<usize>,

    #[arg(long, help = "Probability (0-1) of dropping each received datagram")]
    drop_probability: Option<f32>,

    #[arg(long, help = "Store every field on every frame")]
    log_everything: bool,

    #[arg(long, help = "Stop after this many seconds")]
    duration: Option<u64>,
}

impl Args {
    fn into_config(self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.connect.is_some() {
            config.connect = self.connect;
        }
        if let Some(rate) = self.tick_rate {
            config.tick_rate = rate;
        }
        if let Some(rate) = self.sync_rate {
            config.sync_rate = rate;
        }
        if let Some(count) = self.objects {
            config.object_count = count;
        }
        if let Some(probability) = self.drop_probability {
            config.transport.drop_probability = probability.clamp(0.0, 1.0);
        }
        if self.log_everything {
            config.history.log_everything = true;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let duration = args.duration.map(Duration::from_secs);
    let config = args.into_config()?;
    log::debug!("{config:?}");

    let running = Arc::new(AtomicBool::new(true));
    if let Some(duration) = duration {
        let running = Arc::clone(&running);
        thread::Builder::new()
            .name("strata-deadline".into())
            .spawn(move || {
                thread::sleep(duration);
                running.store(false, Ordering::SeqCst);
            })?;
    }

    match config.connect.clone() {
        Some(address) => node::run_client(&config, &address, running),
        None => node::run_server(&config, running),
    }
}

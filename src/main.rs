use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use libre2_link::arbitration::{ArbitrationState, PriorityMode};
use libre2_link::config::Config;
use libre2_link::driver::{self, Driver};
use libre2_link::peer::UdpPeer;
use libre2_link::store::{JsonFileStore, StateStore};
use libre2_link::{CoreEvent, GlucoseSample, LinkError, LinkState, SensorIdentity, Session};

const DEFAULT_STATE_FILE: &str = "libre2-link-state.json";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Local,
    Peer,
    Auto,
}

impl From<Mode> for PriorityMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Local => PriorityMode::LocalAlwaysPriority,
            Mode::Peer => PriorityMode::PeerAlwaysPriority,
            Mode::Auto => PriorityMode::Auto,
        }
    }
}

/// Streams glucose readings from a Libre 2 sensor and prints them as CSV.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Sensor uid, 8 bytes of hex
    #[arg(long, requires_all = ["patch_info", "serial"])]
    uid: Option<String>,
    /// Patch info from NFC activation, hex
    #[arg(long)]
    patch_info: Option<String>,
    /// Sensor serial number
    #[arg(long)]
    serial: Option<String>,
    #[arg(long, default_value_t = 0)]
    unlock_counter: u16,
    /// Who gets the sensor when the peer wants it too
    #[arg(long, value_enum)]
    mode: Option<Mode>,
    /// Treat the local UI as in the foreground for `auto` priority
    #[arg(long)]
    ui_active: bool,
    /// Seconds to wait before scanning again after the link drops
    #[arg(long, default_value_t = 5)]
    retry_secs: u64,
}

fn identity(cli: &Cli, config: &Config) -> anyhow::Result<Option<SensorIdentity>> {
    match (&cli.uid, &cli.patch_info, &cli.serial) {
        (Some(uid), Some(patch_info), Some(serial)) => Ok(Some(SensorIdentity::from_hex(
            uid,
            patch_info,
            serial,
            cli.unlock_counter,
        )?)),
        _ => Ok(config.sensor.clone()),
    }
}

fn print_sample(sample: &GlucoseSample) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let glucose = sample.current_glucose().map(|g| g.to_string()).unwrap_or_default();
    let trend = sample
        .trend()
        .iter()
        .map(|r| r.raw_value().to_string())
        .collect::<Vec<_>>()
        .join(" ");
    println!(
        "{now},{glucose},{},{},{trend}",
        sample.current_glucose_raw(),
        sample.sensor_age_minutes()
    );
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };

    let state_path = config.state_file.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE));
    let mut store = JsonFileStore::open(&state_path).with_context(|| format!("opening {}", state_path.display()))?;

    let mut identity = identity(&cli, &config)?;
    let persisted = match identity.as_mut() {
        Some(identity) => {
            store.bind_sensor(identity.uid())?;
            let persisted = store.load()?;
            if let Some(counter) = persisted.unlock_counter {
                identity.restore_unlock_counter(counter);
            }
            info!(serial = identity.serial(), counter = identity.unlock_counter(), "sensor");
            persisted
        }
        None => {
            warn!("no sensor identity given, readings cannot be decrypted");
            store.load()?
        }
    };

    let mode = cli.mode.map(PriorityMode::from).unwrap_or(config.arbitration.mode);
    let session = Session::new(config.link.clone(), mode, identity, persisted.known_address());

    let peer = match config.peer.listen {
        Some(listen) => Some(UdpPeer::bind(listen, config.peer.remote).await?),
        None => None,
    };

    let adapter = driver::default_adapter().await?;
    let (driver, handle) = Driver::new(adapter, session, store, peer.clone());
    let mut events = handle.subscribe();
    tokio::spawn(async move {
        if let Err(error) = driver.run().await {
            warn!(%error, "driver stopped");
        }
    });

    if let Some(peer) = &peer {
        let (tx, mut rx) = mpsc::unbounded_channel();
        peer.spawn_listener(tx);
        let handle = handle.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                handle.deliver_peer_message(msg);
            }
        });
    }

    handle.set_ui_active(cli.ui_active);
    handle.start_scanning();

    let retry = Duration::from_secs(cli.retry_secs);
    let mut arbitration = ArbitrationState::LocalDisconnected;
    let mut link = LinkState::Idle;
    let mut retry_at: Option<Instant> = None;
    loop {
        let deadline = retry_at;
        let wait = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            event = events.recv() => match event {
                Ok(CoreEvent::Sample(sample)) => print_sample(&sample),
                // one per bad frame, too noisy for the console
                Ok(CoreEvent::Error(LinkError::IntegrityError)) => debug!("frame dropped"),
                Ok(CoreEvent::Error(error)) => warn!(%error, "link error"),
                Ok(CoreEvent::ArbitrationState(state)) => {
                    info!(%state, "arbitration");
                    arbitration = state;
                    if link.is_resting() {
                        retry_at = Some(Instant::now() + retry);
                    }
                }
                Ok(CoreEvent::LinkState(state)) => {
                    info!(%state, "link");
                    link = state;
                    retry_at = link.is_resting().then(|| Instant::now() + retry);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => warn!(missed, "event receiver lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = wait => {
                retry_at = None;
                if link.is_resting() && arbitration != ArbitrationState::PeerOwnsLink {
                    info!("scanning again");
                    handle.start_scanning();
                }
            }
        }
    }
    Ok(())
}

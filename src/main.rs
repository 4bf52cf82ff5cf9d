use std::{error::Error, process, sync::Arc, time::Duration};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, warn, LevelFilter};
use rand::Rng;
use tokio::sync::broadcast::error::RecvError;

use spotlink::{
    apresolve::{ApResolver, Discovery},
    cluster::ClusterMiddleware,
    config::Config,
    connection::{ApConnector, ConnectionProvider},
    credentials::Credentials,
    remote::{provider::RemoteConnectionProvider, RemoteEvent},
    signal,
    token::{KeymasterTokenProvider, TokenProvider},
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// How long to wait for the relay to assign a connection id.
const CONNECTION_ID_TIMEOUT: Duration = Duration::from_secs(10);

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Secrets file
    ///
    /// Keep this file private: it holds your password or a reusable login
    /// blob.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("secrets.toml"))]
    secrets_file: String,

    /// Device name
    ///
    /// [default: system hostname]
    #[arg(short, long, value_hint = ValueHint::Hostname)]
    name: Option<String>,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module("spotlink", level);
    }

    logger.init();
}

fn load_credentials(secrets_file: &str) -> spotlink::error::Result<Credentials> {
    Credentials::from_file(secrets_file).inspect_err(|_| {
        info!("see secrets.toml.example for the format of {secrets_file}");
    })
}

/// Follows one relay connection until it goes away.
async fn session(
    remotes: &RemoteConnectionProvider,
    middleware: &Arc<ClusterMiddleware>,
) -> spotlink::error::Result<()> {
    let remote = remotes.connect().await?;
    let mut remote_events = remote.subscribe();
    let follower = middleware.spawn(&remote);

    tokio::time::timeout(CONNECTION_ID_TIMEOUT, remote.wait_for_connection_id())
        .await
        .map_err(|_| spotlink::error::Error::deadline_exceeded("relay sent no connection id"))??;
    info!("remote control channel ready");

    loop {
        match remote_events.recv().await {
            Ok(RemoteEvent::Command(command)) => {
                info!(
                    "ignoring {} command from {}",
                    command.endpoint, command.sent_by_device_id
                );
                remote.reply(&command.key, false)?;
            }
            Ok(RemoteEvent::Disconnected) | Err(RecvError::Closed) => break,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!("missed {skipped} remote events"),
        }
    }

    if let Err(e) = follower.await {
        error!("cluster follower failed: {e}");
    }
    Err(spotlink::error::Error::unavailable("remote disconnected"))
}

/// Main application loop.
///
/// Reconnects whenever the relay goes away, after a short random delay.
/// Exits on a rejected login, Ctrl-C or SIGTERM.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let credentials = load_credentials(&args.secrets_file)?;

    let mut config = Config::new()?;
    config.device_name = args
        .name
        .or_else(sysinfo::System::host_name)
        .unwrap_or_else(|| config.app_name.clone());
    debug!("device name: {}", config.device_name);

    let discovery: Arc<dyn Discovery> = Arc::new(ApResolver::new(&config)?);
    let connections = Arc::new(ConnectionProvider::new(
        ApConnector::new(config.clone(), Arc::clone(&discovery)),
        credentials,
    ));
    let tokens: Arc<dyn TokenProvider> = Arc::new(KeymasterTokenProvider::new(
        Arc::clone(&connections),
        &config,
    ));
    let remotes = RemoteConnectionProvider::new(&config, discovery, tokens);

    let middleware = Arc::new(ClusterMiddleware::default());
    let mut events = middleware.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!("{event}"),
                Err(RecvError::Lagged(skipped)) => warn!("missed {skipped} playback events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut signals = signal::Handler::new()?;

    // Reconnect after sleeping some duration to prevent hammering the
    // service. The initial connection happens immediately.
    let restart_timer = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(restart_timer);

    loop {
        tokio::select! {
            // Prioritize shutdown signals.
            biased;

            signal = signals.recv() => {
                remotes.disconnect().await;
                connections.disconnect().await;

                if signal.is_shutdown() {
                    info!("received {signal}, shutting down gracefully");
                    break Ok(());
                }

                info!("received {signal}, reconnecting");
                restart_timer.as_mut().reset(tokio::time::Instant::now());
            }

            result = session(&remotes, &middleware), if restart_timer.is_elapsed() => {
                if let Err(e) = result {
                    if e.auth_failure().is_some() {
                        break Err(e.into());
                    }
                    error!("{e}");
                }

                // Sleep with jitter to prevent thundering herds. Subsecond
                // precision further prevents that by spreading requests
                // when users are launching this from some crontab.
                let duration = Duration::from_millis(rand::thread_rng().gen_range(5_000..6_000));
                info!("reconnecting in {:.1}s", duration.as_secs_f32());
                restart_timer.as_mut().reset(tokio::time::Instant::now() + duration);
            }

            () = &mut restart_timer, if !restart_timer.is_elapsed() => {}
        }
    }
}

/// Main entry point of the application.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}

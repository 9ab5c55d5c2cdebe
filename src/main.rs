use std::{error::Error, path::Path, process, sync::Arc, time::Duration};

use clap::{command, Parser, ValueEnum, ValueHint};
use log::{debug, error, info, warn, LevelFilter};

use spotweb::{
    auth::{login::Login, JsonFileStore},
    captcha::{TaskSolver, Vendor},
    config::Config,
    dealer::Channel,
    events::{handler, EventManager},
    http, secrets,
    signal::{self, Request},
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Delay before reconnecting a failed realtime channel.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Events logged while connected.
const WATCHED_EVENTS: [&str; 3] = [
    "PLAYER_STATE_CHANGED",
    "DEVICE_STATE_CHANGED",
    "DEVICES_DISAPPEARED",
];

#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum CaptchaVendor {
    #[default]
    Capsolver,
    Capmonster,
}

impl From<CaptchaVendor> for Vendor {
    fn from(vendor: CaptchaVendor) -> Self {
        match vendor {
            CaptchaVendor::Capsolver => Vendor::CapSolver,
            CaptchaVendor::Capmonster => Vendor::CapMonster,
        }
    }
}

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Secrets file
    ///
    /// Holds the login identifier and password. Ensure that this file is
    /// kept secure and not shared publicly.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("secrets.toml"))]
    secrets_file: String,

    /// Session store
    ///
    /// Sessions are restored from and saved to this file, so that logging
    /// in again is only needed when a session expires.
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("sessions.json"))]
    session_store: String,

    /// Captcha solving service
    #[arg(long, value_enum, default_value_t)]
    captcha_vendor: CaptchaVendor,

    /// API key of the captcha solving service
    ///
    /// Only needed when no stored session can be restored.
    #[arg(long, env = "SPOTWEB_CAPTCHA_KEY", hide_env_values = true)]
    captcha_key: Option<String>,

    /// Device id to present on the realtime channel
    ///
    /// [default: random]
    #[arg(long)]
    device_id: Option<String>,

    /// Device name to present on the realtime channel
    #[arg(long, default_value_t = Config::default().device_name)]
    device_name: String,

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
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module("spotweb", level);
    }

    logger.init();
}

/// Restores the stored session of the configured account, or logs in and
/// stores the new session.
async fn authenticate(
    args: &Args,
    config: &Config,
    http: Arc<http::Client>,
) -> Result<Login, Box<dyn Error>> {
    if !Path::new(&args.secrets_file).exists() {
        info!(
            "copy secrets.toml.example to {} and fill in your credentials",
            args.secrets_file
        );
    }
    let credentials = secrets::load(&args.secrets_file)?;
    let store = JsonFileStore::new(&args.session_store);

    match Login::from_store(Arc::clone(&http), config, &store, &credentials.identifier).await {
        Ok(login) => {
            info!("restored session of {}", login.identifier());
            return Ok(login);
        }
        Err(e) => debug!("no stored session: {e}"),
    }

    let Some(api_key) = args.captcha_key.clone() else {
        return Err("no stored session and no captcha key to log in with".into());
    };
    let solver = TaskSolver::new(Arc::clone(&http), args.captcha_vendor.into(), api_key)?;

    let mut login = Login::new(http, config, credentials).with_solver(Arc::new(solver));
    login.login().await?;
    login.save(&store).await?;

    Ok(login)
}

/// Waits before reconnecting. Returns whether a shutdown was requested
/// meanwhile.
async fn shutdown_during_backoff(signals: &mut signal::Handler) -> bool {
    info!("reconnecting in {}s", RECONNECT_DELAY.as_secs());
    tokio::select! {
        request = signals.recv() => match request {
            Request::Shutdown(signal) => {
                info!("received {signal}, shutting down");
                true
            }
            Request::Refresh => false,
        },
        () = tokio::time::sleep(RECONNECT_DELAY) => false,
    }
}

/// Main application loop.
///
/// Connects the realtime channel, logs pushed events and reconnects when
/// the channel fails, until a shutdown signal arrives.
///
/// # Errors
///
/// Returns error when authentication fails or signals cannot be handled.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = Config {
        device_name: args.device_name.clone(),
        ..Config::default()
    };
    let http = Arc::new(http::Client::new(&config)?);
    let login = authenticate(&args, &config, http).await?;

    let mut signals = signal::Handler::new()?;

    loop {
        let device_id = args
            .device_id
            .clone()
            .unwrap_or_else(|| spotweb::util::random_hex(32));

        let channel = match Channel::connect_as(&login, &config, &device_id).await {
            Ok(channel) => Arc::new(channel),
            Err(e) => {
                error!("{e}");
                if shutdown_during_backoff(&mut signals).await {
                    break Ok(());
                }
                continue;
            }
        };

        let mut manager = match EventManager::start(Arc::clone(&channel)).await {
            Ok(manager) => manager,
            Err(e) => {
                error!("{e}");
                channel.close().await?;
                if shutdown_during_backoff(&mut signals).await {
                    break Ok(());
                }
                continue;
            }
        };
        for event in WATCHED_EVENTS {
            manager.subscribe(
                event,
                handler(move |payload| {
                    debug!("{event}: {payload}");
                    info!("{event}");
                    Ok(())
                }),
            )?;
        }

        let mut health = tokio::time::interval(Duration::from_secs(1));
        let shutdown = loop {
            tokio::select! {
                request = signals.recv() => match request {
                    Request::Shutdown(signal) => {
                        info!("received {signal}, shutting down gracefully");
                        break true;
                    }
                    Request::Refresh => match channel.renew_state().await {
                        Ok(cluster) => info!(
                            "active device: {}",
                            cluster.active_device_id.as_deref().unwrap_or("none")
                        ),
                        Err(e) => warn!("could not refresh state: {e}"),
                    },
                },
                _ = health.tick() => if !manager.is_listening() {
                    break false;
                },
            }
        };

        channel.close().await?;
        if let Err(e) = manager.stop().await {
            error!("{e}");
        }

        if shutdown {
            break Ok(());
        }
        info!("realtime channel lost, reconnecting");
    }
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and starts the main application loop.
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

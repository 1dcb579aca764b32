use clap::{ArgAction, Parser};
use horcrux_monitor::{
    alerter::{LogNotifier, NotifierSet, SlackNotifier, TelegramAlerter},
    collector::Collector,
    config::AppConfig,
    render::Renderer,
    service::{build_engine, collect_until_shutdown, persist, process_cycle},
    storage::StateStore,
};
use std::path::PathBuf;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::{EnvFilter, filter::Directive};

#[derive(Debug, Parser)]
#[command(
    name = "horcrux-monitor",
    version,
    about = "Health monitor and alerting daemon for a Horcrux threshold signer"
)]
struct Cli {
    #[arg(
        long = "config",
        value_name = "PATH",
        env = "HORCRUX_MONITOR_CONFIG",
        help = "Path to the monitor's YAML config file."
    )]
    config: PathBuf,
    #[arg(
        long = "dry-run",
        action = ArgAction::SetTrue,
        help = "Only log reports. Nothing is sent to Slack or Telegram and no state is persisted."
    )]
    dry_run: bool,
    #[arg(
        long = "once",
        action = ArgAction::SetTrue,
        help = "Run a single startup cycle and exit."
    )]
    once: bool,
    #[arg(
        long = "log.level",
        default_value_t = Level::INFO,
        value_name = "LOG_LEVEL",
        env = "HORCRUX_MONITOR_LOG_LEVEL",
        help = "The verbosity level used for logs.",
        long_help = "Possible values: info, debug, trace, warn, error. RUST_LOG overrides it."
    )]
    log_level: Level,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_level);

    if let Err(error) = run(cli).await {
        error!(error = %error, "horcrux-monitor failed");
        std::process::exit(1);
    }
}

fn init_tracing(level: Level) {
    let filter = EnvFilter::builder()
        .with_default_directive(Directive::from(level))
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(matches!(level, Level::DEBUG | Level::TRACE))
        .init();
}

async fn run(cli: Cli) -> eyre::Result<()> {
    let config = AppConfig::load(&cli.config)?;

    let mut store = if cli.dry_run {
        StateStore::disabled()
    } else {
        StateStore::open(&config.state_file)
    };
    let mut engine = build_engine(&config, store.load())?;
    let collector = Collector::new(&config)?;
    let renderer = Renderer::new(&config);
    let notifiers = build_notifiers(&config, cli.dry_run)?;

    info!(
        name = %config.name,
        interval_secs = config.check_interval.as_secs(),
        transports = ?notifiers.names(),
        dry_run = cli.dry_run,
        persistent = store.is_enabled(),
        "horcrux-monitor started"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let mut ticker = time::interval(config.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = shutdown.cancelled() => break,
        }

        let Some(input) = collect_until_shutdown(&collector, &shutdown, config.shutdown_grace).await else {
            break;
        };
        process_cycle(&mut engine, &mut store, &renderer, &notifiers, &input).await;

        if cli.once {
            break;
        }
    }

    persist(&engine, &mut store);
    info!(cycles = engine.cycles(), "horcrux-monitor stopped");
    Ok(())
}

fn build_notifiers(config: &AppConfig, dry_run: bool) -> eyre::Result<NotifierSet> {
    let mut notifiers = NotifierSet::default();
    notifiers.push(LogNotifier);
    if dry_run {
        return Ok(notifiers);
    }

    if let Some(slack) = &config.slack {
        let client = reqwest::Client::builder().timeout(config.metrics_timeout).build()?;
        notifiers.push(SlackNotifier::new(client, slack));
    }
    if let Some(telegram) = &config.telegram {
        notifiers.push(TelegramAlerter::new(telegram));
    }
    Ok(notifiers)
}

async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
                    _ = terminate.recv() => info!("received SIGTERM, shutting down"),
                }
            }
            Err(error) => {
                warn!(%error, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
                info!("received SIGINT, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c, shutting down");
    }

    shutdown.cancel();
}

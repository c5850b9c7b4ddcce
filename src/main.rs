use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use podd::chain::memory::{
    MedianTimeSource, MemoryAddrManager, MemoryCfIndex, MemoryChain, MemoryMempool, MemoryMetadata,
    MemorySyncManager, MemoryTemplateGenerator, RecordingConnManager, StaticFeeEstimator,
};
use podd::chain::TimeSource;
use podd::config::{self, Config, DEFAULT_CONFIG_FILE, DEFAULT_KOPACH_PORT};
use podd::error::AppError;
use podd::kopach::{Controller, Coordinator, CoordinatorSettings, HashrateMeter, Worker};
use podd::network::{Collaborators, Node, NodeSettings};
use podd::network_type::NetworkType;
use podd::rpc::{GbtWorkState, RpcHandler, RpcServer, RPC_HANDLERS};
use podd::shutdown::ShutdownManager;

/// Fee per kilobyte reported until a real estimator is plugged in.
const STATIC_FEE_PER_KB: f64 = 0.0001;

#[derive(Parser, Debug)]
#[command(name = "podd")]
#[command(about = "pod full node with LAN mining", long_about = None)]
struct Args {
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: String,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    generate_config: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the full node (default)
    Node,
    /// Run the LAN miner
    Kopach,
    /// Mining worker; started by kopach, talks over stdin/stdout
    Worker {
        network: String,
        log_level: String,
        #[arg(long, default_value_t = DEFAULT_KOPACH_PORT)]
        port: u16,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // stdout belongs to the coordinator
    if let Some(Commands::Worker {
        network,
        log_level,
        port,
    }) = &args.command
    {
        let logging = config::LoggingConfig {
            level: log_level.clone(),
            output: "stderr".to_string(),
            ..Default::default()
        };
        let _guard = setup_logging(&logging, false);
        if let Err(e) = network.parse::<NetworkType>() {
            tracing::error!("❌ {}", e);
            std::process::exit(1);
        }
        let worker = Worker::new(*port);
        if let Err(e) = worker.serve(tokio::io::stdin(), tokio::io::stdout()).await {
            tracing::error!("worker failed: {}", e);
            std::process::exit(1);
        }
        return;
    }

    if args.generate_config {
        match Config::default().save_to_file(&args.config) {
            Ok(()) => {
                println!("✅ Generated default config at: {}", args.config);
                return;
            }
            Err(e) => {
                eprintln!("❌ Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let config = match Config::load_or_create(&args.config, NetworkType::Mainnet)
        .and_then(|c| c.validate().map(|()| c))
    {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("❌ Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let _guard = setup_logging(&config.logging, args.verbose);

    let result = match args.command {
        Some(Commands::Kopach) => run_kopach(&config).await,
        _ => run_node(&config).await,
    };
    if let Err(e) = result {
        tracing::error!("❌ {}", e);
        std::process::exit(1);
    }
}

async fn run_node(config: &Config) -> Result<(), AppError> {
    let settings = NodeSettings::from_config(config)?;
    let network = settings.network;
    tracing::info!(
        "🚀 podd v{} ({}) starting on {} (data dir {})",
        env!("CARGO_PKG_VERSION"),
        option_env!("GIT_HASH").unwrap_or("unknown"),
        network.name(),
        config.data_dir().display()
    );

    let time_source: Arc<dyn TimeSource> = Arc::new(MedianTimeSource::default());
    let chain = Arc::new(MemoryChain::new(network, time_source.clone()));
    let mempool = Arc::new(MemoryMempool::new(chain.clone()));
    let deps = Collaborators {
        chain: chain.clone(),
        mempool: mempool.clone(),
        sync_manager: Arc::new(MemorySyncManager::new(chain.clone(), mempool.clone())),
        addr_manager: Arc::new(MemoryAddrManager::default()),
        conn_manager: Arc::new(RecordingConnManager::default()),
        cf_index: Some(Arc::new(MemoryCfIndex::new(chain.clone()))),
        time_source: time_source.clone(),
        fee_estimator: Some(Arc::new(StaticFeeEstimator::new(STATIC_FEE_PER_KB))),
        metadata: Arc::new(MemoryMetadata::default()),
        template_generator: Arc::new(MemoryTemplateGenerator::new(chain, mempool, time_source.clone())),
    };

    // setgenerate can switch mining on later when payout addresses exist
    let run_controller = settings.generate || !settings.mining_addrs.is_empty();
    let rpc_enabled = settings.rpc_enabled;
    let node = Node::new(settings, deps);
    let mut shutdown_manager = ShutdownManager::new();
    let shutdown_token = shutdown_manager.token();
    node.start();

    let hashrate = Arc::new(HashrateMeter::new());
    if rpc_enabled {
        let gbt = Arc::new(GbtWorkState::new(time_source));
        let handler = Arc::new(RpcHandler::new(
            node.clone(),
            gbt,
            hashrate.clone(),
            config.mining.gen_threads,
            RPC_HANDLERS,
        ));
        match RpcServer::new(config, handler) {
            Ok(server) => {
                for task in Arc::new(server).start().await? {
                    shutdown_manager.register_task(task);
                }
            }
            Err(AppError::Config(msg)) => tracing::warn!("⚠️  RPC disabled: {}", msg),
            Err(e) => return Err(e),
        }
    }

    if run_controller {
        let listen_port = p2p_port(config, network);
        let controller = Controller::new(
            node.clone(),
            config.mining.port,
            &config.mining.pass,
            listen_port,
            hashrate,
        )?;
        let token = shutdown_token.clone();
        shutdown_manager.register_task(tokio::spawn(controller.run(token)));
    }

    // the RPC listeners only exit once the node stops
    let stopper = node.clone();
    let token = shutdown_token.clone();
    shutdown_manager.register_task(tokio::spawn(async move {
        token.cancelled().await;
        if let Err(e) = stopper.stop() {
            tracing::error!("node stop failed: {}", e);
        }
    }));

    shutdown_manager
        .wait_for_shutdown(node.shutdown_requested())
        .await;
    node.wait_for_shutdown().await;
    tracing::info!("👋 podd stopped");
    Ok(())
}

async fn run_kopach(config: &Config) -> Result<(), AppError> {
    let settings = CoordinatorSettings {
        network: config.node.network_type(),
        log_level: config.logging.level.clone(),
        gen_threads: config.mining.gen_threads,
        pass: config.mining.pass.clone(),
        broadcast_port: config.mining.port,
    };
    let coordinator = Coordinator::spawn(&settings).await?;
    let token = CancellationToken::new();
    let run = coordinator.run(token.clone());
    tokio::pin!(run);
    tokio::select! {
        _ = &mut run => {}
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("🛑 Shutdown signal received");
            token.cancel();
            run.await;
        }
    }
    Ok(())
}

/// Port of the first P2P listener; it names this node to the miners.
fn p2p_port(config: &Config, network: NetworkType) -> u16 {
    config
        .network
        .listeners
        .iter()
        .find_map(|l| l.parse::<std::net::SocketAddr>().ok())
        .map(|a| a.port())
        .unwrap_or_else(|| network.default_p2p_port())
}

fn setup_logging(
    config: &config::LoggingConfig,
    verbose: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "trace" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let is_systemd =
        std::env::var("JOURNAL_STREAM").is_ok() || std::env::var("INVOCATION_ID").is_ok();

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

    let mut guard = None;
    let writer = match config.output.as_str() {
        "file" if !config.file_path.is_empty() => {
            let path = std::path::Path::new(&config.file_path);
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "podd.log".to_string());
            let (non_blocking, g) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));
            guard = Some(g);
            BoxMakeWriter::new(non_blocking)
        }
        "stderr" => BoxMakeWriter::new(std::io::stderr),
        _ => BoxMakeWriter::new(std::io::stdout),
    };

    match config.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_thread_ids(false)
                .init();
        }
        _ if is_systemd => {
            // journald adds its own timestamp and hostname
            fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .without_time()
                .compact()
                .init();
        }
        _ => {
            fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .with_timer(HostTimer {
                    hostname: short_hostname,
                })
                .compact()
                .init();
        }
    }
    guard
}

// UTC time plus the short hostname, e.g. "2025-12-10 18:09:43.150 [server1]"
struct HostTimer {
    hostname: String,
}

impl tracing_subscriber::fmt::time::FormatTime for HostTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}

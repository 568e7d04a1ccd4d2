use anyhow::{bail, Context, Result};
use bridge_core::{
    api,
    chain_adapter::{connect_destination, connect_source},
    config::LoggingConfig,
    relayer::probe,
    store::{FileStateStore, MemoryStateStore, StateStore},
    watcher::SourceWatcher,
    Config, Relayer,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 验证并解析配置文件
    ValidateConfig {
        /// 配置文件路径
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
    /// 启动中继服务
    Start {
        /// 配置文件路径
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
        /// 从指定的源链区块开始扫描，覆盖回放窗口
        #[arg(long, value_name = "BLOCK")]
        from_block: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = match &cli.command {
        Commands::ValidateConfig { config } | Commands::Start { config, .. } => config.clone(),
    };
    // 先安装日志，加载配置时的输出才不会丢失
    init_logging(&Config::read_logging(&config_path));
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration {:?}: {}", config_path, e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::ValidateConfig { .. } => validate(&config),
        Commands::Start { from_block, .. } => start(config, from_block).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// `RUST_LOG` 优先于配置中的日志级别
fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = fmt().with_env_filter(filter).with_target(true);
    let installed = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = installed {
        eprintln!("Failed to install log subscriber: {}", e);
    }
}

fn validate(config: &Config) -> Result<()> {
    info!("Configuration is valid");
    println!("配置文件验证成功!");
    println!("配置内容概要:");
    println!(
        "- 源链: {} ({}) 合约 {} 节点 {}",
        config.source.id,
        config.source.adapter_type,
        config.source.bridge_address,
        bridge_core::config::redact_url(&config.source.rpc_url)
    );
    println!(
        "- 目标链: {} ({}) canister {}",
        config.destination.id, config.destination.adapter_type, config.destination.canister_id
    );
    println!(
        "- 中继器: 最大重试次数 {}, 重试延迟 {}毫秒, RPC 超时 {}毫秒",
        config.relayer.max_retries, config.relayer.retry_delay_ms, config.relayer.rpc_timeout_ms
    );
    match &config.relayer.state_path {
        Some(path) => println!("- 状态文件: {}", path.display()),
        None => println!("- 状态文件: 无 (仅保存在内存中)"),
    }
    println!("- 健康检查接口: {}:{}", config.api.bind_address, config.api.port);
    println!("{}", serde_json::to_string_pretty(&config.sanitized())?);
    Ok(())
}

async fn start(config: Config, from_block: Option<u64>) -> Result<()> {
    info!(name = %config.relayer.name, "Starting relay service");

    let rpc_timeout = config.relayer.rpc_timeout();
    let source = connect_source(&config.source, rpc_timeout)?;
    let destination = connect_destination(&config.destination, rpc_timeout)?;

    let source_health = probe(&config.source.id, rpc_timeout, source.health()).await;
    if !source_health.connected {
        bail!(
            "Cannot reach source ledger {}: {}",
            source_health.chain_id,
            source_health.error.unwrap_or_default()
        );
    }
    info!(chain = %source_health.chain_id, block = ?source_health.block_number, "Source ledger connected");

    let destination_health =
        probe(&config.destination.id, rpc_timeout, destination.health()).await;
    if !destination_health.connected {
        bail!(
            "Cannot reach destination ledger {}: {}",
            destination_health.chain_id,
            destination_health.error.unwrap_or_default()
        );
    }
    info!(chain = %destination_health.chain_id, "Destination ledger connected");

    let store: Arc<dyn StateStore> = match &config.relayer.state_path {
        Some(path) => Arc::new(
            FileStateStore::open(path)
                .with_context(|| format!("Failed to open state log {}", path.display()))?,
        ),
        None => Arc::new(MemoryStateStore),
    };

    let relayer = Arc::new(Relayer::new(
        config.clone(),
        source.clone(),
        destination,
        store,
    )?);

    let listener = api::bind(&config.api.bind_address, config.api.port).await?;
    let (api_stop_tx, api_stop_rx) = oneshot::channel::<()>();
    let api_task = tokio::spawn(api::serve(listener, relayer.clone(), async {
        let _ = api_stop_rx.await;
    }));

    let (tx, rx) = mpsc::channel(config.relayer.channel_capacity);
    let (watcher_stop_tx, watcher_stop_rx) = mpsc::channel::<()>(1);
    let (relayer_stop_tx, relayer_stop_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = relayer_stop_tx.send(()).await;
        let _ = watcher_stop_tx.send(()).await;
    });

    let mut watcher = SourceWatcher::new(source, config.source.clone(), rpc_timeout);
    if let Some(block) = from_block {
        watcher = watcher.with_start_block(block);
    }
    let watcher_task = tokio::spawn(async move { watcher.run(tx, watcher_stop_rx).await });

    // 收到停止信号后不再重试，清空通道后等待 watcher 释放发送端再返回
    relayer.start(rx, relayer_stop_rx).await;

    watcher_task.await??;
    let _ = api_stop_tx.send(());
    api_task.await??;

    info!("Relay service stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating shutdown"),
    }
}

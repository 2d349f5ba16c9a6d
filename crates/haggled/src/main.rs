//! haggled - Haggle opportunistic data sharing daemon
//!
//! Starts the event kernel with the full manager set and runs until a clean
//! shutdown. Exit code 0 on clean shutdown, non-zero on initialization
//! failure.

use clap::Parser;
use haggled::application::ApplicationManager;
use haggled::config::Config;
use haggled::connectivity::{ConnectivityConfig, ConnectivityManager};
use haggled::data_manager::{DataManager, DataManagerConfig};
use haggled::forwarding::ForwardingManager;
use haggled::kernel::{Kernel, KernelCore};
use haggled::node_manager::NodeManager;
use haggled::protocol::ProtocolManager;
use haggled::{connectivity, datastore};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    if let Err(e) = config.validate() {
        eprintln!("invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    if config.daemonize {
        return spawn_detached();
    }

    if let Err(e) = std::fs::create_dir_all(&config.storage) {
        eprintln!(
            "could not create storage directory {}: {}",
            config.storage.display(),
            e
        );
        return ExitCode::FAILURE;
    }

    init_logging(&config);

    info!(
        "haggled v{} starting (storage: {})",
        env!("CARGO_PKG_VERSION"),
        config.storage.display()
    );

    match run(&config).await {
        Ok(()) => {
            info!("clean shutdown");
            let _ = std::fs::remove_file(config.pid_file());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("initialization failed: {}", e);
            let _ = std::fs::remove_file(config.pid_file());
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &Config) {
    let default_directive = if config.verbose { "haggled=debug" } else { "haggled=info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(default_directive.parse().expect("static directive parses"));

    let registry = tracing_subscriber::registry().with(filter).with(fmt::layer());
    match std::fs::File::create(config.trace_log()) {
        Ok(file) => {
            registry
                .with(fmt::layer().with_ansi(false).with_writer(std::sync::Mutex::new(file)))
                .init();
        }
        Err(e) => {
            registry.init();
            tracing::warn!("could not open trace log: {}", e);
        }
    }
}

async fn run(config: &Config) -> anyhow::Result<()> {
    std::fs::write(config.pid_file(), format!("{}\n", std::process::id()))?;

    // Local interfaces determine the node id, so probe them up front and
    // hand the same list to the connectivity manager
    let locals = connectivity::probe_local_interfaces();
    let macs: Vec<[u8; 6]> = locals.iter().filter_map(|i| i.mac()).collect();
    let this_node = haggle_core::Node::this_node(config.node_name(), &macs).into_ref();
    info!("this node: {}", this_node.read());

    let core = KernelCore::new(this_node, config.storage.clone());
    let store = datastore::spawn(&config.db_path(), core.queue().clone())?;
    core.attach_datastore(store.clone());

    let mut kernel = Kernel::new(core.clone());
    kernel.register(Box::new(DataManager::new(
        core.clone(),
        DataManagerConfig {
            max_age: Duration::from_secs(config.max_data_object_age_secs),
            age_period: Duration::from_secs(config.age_period_secs),
        },
    )));
    kernel.register(Box::new(NodeManager::new(core.clone())));
    kernel.register(Box::new(ForwardingManager::new(core.clone())));
    kernel.register(Box::new(ConnectivityManager::new(
        core.clone(),
        ConnectivityConfig {
            beacon_port: config.beacon_port,
            beacon_interval: config.beacon_interval(),
            locals,
        },
    )));
    kernel.register(Box::new(ProtocolManager::new(core.clone(), config.tcp_port)));
    kernel.register(Box::new(ApplicationManager::new(core.clone(), config.ipc_port)));

    {
        let core = core.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received interrupt");
                core.shutdown();
            }
        });
    }

    kernel.run().await;
    store.shutdown();
    Ok(())
}

/// Re-exec ourselves detached from the controlling terminal
fn spawn_detached() -> ExitCode {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            eprintln!("could not resolve own executable: {e}");
            return ExitCode::FAILURE;
        }
    };
    let args: Vec<String> = std::env::args()
        .skip(1)
        .filter(|a| a != "-d" && a != "--daemonize")
        .collect();
    match std::process::Command::new(exe)
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
    {
        Ok(child) => {
            println!("{}", child.id());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("could not detach: {e}");
            ExitCode::FAILURE
        }
    }
}

//! Command handlers for watch, agent and status.

use anyhow::{Context, Result, bail};
use colored::Colorize;
use log::{debug, info, warn};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::broker::{Broker, BrokerKind, MemoryBroker, SqliteBroker};
use crate::catalog::{Catalog, ModuleSelection, check_os};
use crate::engine::arg_parser::{Cli, Commands, CommonArgs, WatchArgs};
use crate::monitor::{CaseMonitor, MonitorExit};
use crate::store::CoordinationStore;
use crate::utils::logger::colorize_status;
use crate::utils::{AppConfig, load_app_config, resolve_agent, setup_logging};
use crate::worker::{ModuleRegistry, PoolManager, PoolOptions, ProcessCommandRunner, TaskRunner};
use crate::CaseContext;

/// Parse-independent entry point of the binary.
pub fn handle_run(cli: &Cli) -> Result<()> {
    setup_logging(cli.verbose);
    let config_path = cli.config_path();
    let mut cfg = load_app_config(&config_path)?;
    let env_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    cfg.agent = resolve_agent(env_dir);
    debug!("agent id: {}", cfg.agent);

    match &cli.command {
        Commands::Watch(args) => handle_watch(args, cfg),
        Commands::Agent(common) => handle_agent(common, cfg),
        Commands::Status { case, common } => handle_status(case, common, cfg),
    }
}

fn apply_common(common: &CommonArgs, cfg: &mut AppConfig) {
    if let Some(p) = &common.store {
        cfg.store_path = p.clone();
    }
    if let Some(b) = common.broker {
        cfg.broker = b;
    }
}

fn apply_watch(args: &WatchArgs, cfg: &mut AppConfig) -> Result<()> {
    apply_common(&args.common, cfg);
    if let Some(p) = &args.catalog {
        cfg.catalog_dir = p.clone();
    }
    if let Some(s) = args.scan_interval {
        cfg.scan_interval =
            std::time::Duration::try_from_secs_f64(s).context("--scan-interval must be >= 0")?;
    }
    if let Some(s) = args.cooldown {
        cfg.cooldown = std::time::Duration::try_from_secs_f64(s).context("--cooldown must be >= 0")?;
    }
    if let Some(p) = args.on_dispatch_failure {
        cfg.on_dispatch_failure = p;
    }
    Ok(())
}

fn open_broker(cfg: &AppConfig) -> Result<Arc<dyn Broker>> {
    Ok(match cfg.broker {
        BrokerKind::Memory => Arc::new(MemoryBroker::new()),
        BrokerKind::Sqlite => Arc::new(
            SqliteBroker::open(&cfg.store_path)
                .with_context(|| format!("open queue store {}", cfg.store_path.display()))?,
        ),
    })
}

fn start_pool(
    cfg: &AppConfig,
    store: &Arc<CoordinationStore>,
    broker: &Arc<dyn Broker>,
) -> Result<PoolManager> {
    let runner = TaskRunner::new(
        Arc::clone(store),
        Arc::new(ModuleRegistry::with_builtins()),
        Arc::new(ProcessCommandRunner::default()),
        cfg.worker_settings(),
    );
    PoolManager::start(
        &cfg.pool_table(),
        Arc::clone(broker),
        Arc::new(runner),
        PoolOptions::default(),
    )
}

/// Raise `flag` on Ctrl+C. A second Ctrl+C while shutting down is ignored.
fn install_interrupt(flag: Arc<AtomicBool>) {
    let res = ctrlc::set_handler(move || {
        if !flag.swap(true, Ordering::SeqCst) {
            eprintln!("\nInterrupted, finishing current work...");
        }
    });
    if let Err(e) = res {
        warn!("Ctrl+C handler not installed: {}", e);
    }
}

/// Watch one case until it completes or is interrupted.
pub fn handle_watch(args: &WatchArgs, mut cfg: AppConfig) -> Result<()> {
    apply_watch(args, &mut cfg)?;
    if cfg.broker == BrokerKind::Memory && !args.agent {
        bail!("the memory broker has no consumers outside this process; pass --agent");
    }

    let case_path = args
        .case
        .canonicalize()
        .with_context(|| format!("case directory {}", args.case.display()))?;
    if !case_path.is_dir() {
        bail!("{} is not a directory", case_path.display());
    }

    let catalog = Catalog::new(&cfg.catalog_dir);
    let selection = ModuleSelection {
        profile: args.profile.clone(),
        modules: args.module.clone(),
        add: args.module_add.clone(),
        remove: args.module_remove.clone(),
    };
    let names = selection.resolve(&catalog)?;
    let rules = catalog.load_modules(&names)?;
    check_os(&rules)?;
    info!("Modules: {}", names.join(", "));

    let store = Arc::new(
        CoordinationStore::open(&cfg.store_path)
            .with_context(|| format!("open store {}", cfg.store_path.display()))?,
    );
    let broker = open_broker(&cfg)?;

    let cancel = Arc::new(AtomicBool::new(false));
    install_interrupt(Arc::clone(&cancel));

    let mut pool = match args.agent {
        true => Some(start_pool(&cfg, &store, &broker)?),
        false => None,
    };

    let case = CaseContext::new(case_path, names);
    let mut monitor = CaseMonitor::new(
        case,
        rules,
        Arc::clone(&store),
        Arc::clone(&broker),
        &cfg.agent,
        cfg.monitor_settings(args.reprocess),
    )?
    .with_cancel(Arc::clone(&cancel));
    let report = monitor.run();

    if let Some(p) = pool.as_mut() {
        p.shutdown();
    }
    let report = report?;
    match report.exit {
        MonitorExit::Completed => info!(
            "{} {} tasks dispatched over {} cycles",
            "Done:".green(),
            report.dispatched,
            report.cycles
        ),
        MonitorExit::Cancelled => warn!(
            "Cancelled after {} cycles ({} tasks dispatched)",
            report.cycles, report.dispatched
        ),
    }
    Ok(())
}

/// Run only the worker fleet until Ctrl+C.
pub fn handle_agent(common: &CommonArgs, mut cfg: AppConfig) -> Result<()> {
    apply_common(common, &mut cfg);
    if cfg.broker == BrokerKind::Memory {
        bail!("a standalone agent needs the sqlite broker to receive tasks");
    }
    let store = Arc::new(
        CoordinationStore::open(&cfg.store_path)
            .with_context(|| format!("open store {}", cfg.store_path.display()))?,
    );
    let broker = open_broker(&cfg)?;
    let mut pool = start_pool(&cfg, &store, &broker)?;
    install_interrupt(pool.shutdown_flag());
    info!("Agent {} consuming from {}", cfg.agent, cfg.store_path.display());
    pool.wait();
    info!("Agent stopped");
    Ok(())
}

/// Print master status and outstanding work for one case.
pub fn handle_status(case: &Path, common: &CommonArgs, mut cfg: AppConfig) -> Result<()> {
    apply_common(common, &mut cfg);
    let case_path = case
        .canonicalize()
        .with_context(|| format!("case directory {}", case.display()))?;
    let case_str = case_path.to_string_lossy();
    let store = CoordinationStore::open(&cfg.store_path)
        .with_context(|| format!("open store {}", cfg.store_path.display()))?;

    let Some(status) = store.master_status(&case_str)? else {
        println!("{}: {}", case_str, "never watched".dimmed());
        return Ok(());
    };
    println!("{}", case_str.bold());
    println!("  status:  {}", colorize_status(status.status.as_str()));
    println!("  case id: {}", status.case_id);
    println!("  modules: {}", status.modules_selected.join(", "));
    println!("  updated: {}", status.timestamp);

    let counts = store.outstanding_counts(&status.case_id)?;
    if counts.is_empty() {
        println!("  outstanding: {}", "none".green());
    } else {
        println!("  outstanding:");
        for (module, n) in counts {
            println!("    {:<24} {}", module, n.to_string().yellow());
        }
    }
    Ok(())
}

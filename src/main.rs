//! installkit - Main entry point
//!
//! Headless front end for the installer engine: runs a flow to completion,
//! validates configuration files, and previews task plans.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tracing_subscriber::EnvFilter;

use installkit::cli::{Cli, Commands};
use installkit::events::Event;
use installkit::task::FailurePolicy;
use installkit::{
    CancelHandle, Config, HeadlessRunner, ProcessGuard, Registries, Session, TaskPlan, detect_env,
    process_guard,
};

/// Install the tracing subscriber. `RUST_LOG` overrides the default level.
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse_args();
    init_tracing(cli.verbose);
    tracing::debug!("CLI arguments parsed");

    // SIGTERM/SIGHUP terminate spawned task processes before exiting
    if let Err(e) = process_guard::init_signal_handlers() {
        tracing::warn!("Failed to initialize signal handlers: {}", e);
    }

    let outcome = match cli.command {
        Commands::Validate { config } => validate(&config),
        Commands::Plan {
            config,
            action,
            json,
        } => plan(&config, &action, json),
        Commands::Run {
            config,
            action,
            set,
            log_file,
            rollback_on_failure,
            on_failure,
            skip_preflight,
        } => run(RunOptions {
            config,
            action,
            set,
            log_file,
            rollback_on_failure,
            on_failure,
            skip_preflight,
        }),
    };

    match outcome {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("✗ {:#}", e);
            std::process::exit(2);
        }
    }
}

fn validate(path: &Path) -> Result<bool> {
    tracing::info!("Validating configuration file: {:?}", path);
    match Session::from_file(path, Arc::new(Registries::with_builtins())) {
        Ok(session) => {
            let flows = session.workflow().flow_ids().join(", ");
            println!(
                "✓ Configuration is valid: {} (flows: {})",
                session.config().product.name,
                flows
            );
            Ok(true)
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed: {}", e);
            Ok(false)
        }
    }
}

fn plan(path: &Path, action: &str, json: bool) -> Result<bool> {
    let config = Config::load_from_file(path)?;
    config.validate()?;
    let flows = config.all_flows();
    let flow = flows
        .get(action)
        .with_context(|| format!("Flow '{action}' is not defined"))?;

    let plan = TaskPlan::build(action, flow);
    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print!("{plan}");
        if plan.requires_root() {
            println!("Root privileges are required for this flow.");
        }
    }
    Ok(true)
}

struct RunOptions {
    config: PathBuf,
    action: String,
    set: Vec<String>,
    log_file: Option<PathBuf>,
    rollback_on_failure: bool,
    on_failure: FailurePolicy,
    skip_preflight: bool,
}

fn run(options: RunOptions) -> Result<bool> {
    let _process_guard = ProcessGuard::new();

    let mut session = Session::from_file(&options.config, Arc::new(Registries::with_builtins()))?;
    let ctx = Arc::clone(session.context());
    if let Some(log_file) = &options.log_file {
        ctx.set_log_file(log_file)
            .with_context(|| format!("Cannot open log file {:?}", log_file))?;
    }
    for assignment in &options.set {
        session.apply_override(assignment)?;
    }

    if options.skip_preflight {
        let is_root = nix::unistd::geteuid().is_root();
        ctx.update_env(|env| env.is_root = is_root);
    } else {
        detect_env(&ctx);
    }

    let cancel = CancelHandle::new();
    let on_interrupt = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\nCancelling after the current task...");
        on_interrupt.cancel();
    }) {
        tracing::warn!("Failed to install Ctrl-C handler: {}", e);
    }

    let bus = Arc::clone(session.event_bus());
    let events = bus.channel();
    let printer = thread::spawn(move || {
        for event in events {
            print_event(&event);
        }
    });

    let runner = HeadlessRunner::new()
        .rollback_on_failure(options.rollback_on_failure)
        .with_failure_policy(options.on_failure)
        .with_cancel_handle(cancel);
    let result = runner.run(&mut session, &options.action);

    // Dropping the forwarder ends the printer loop
    bus.clear();
    if printer.join().is_err() {
        tracing::warn!("Event printer thread panicked");
    }

    let report = result?;
    match &report.error {
        None => println!("✓ {} completed", report.flow_id),
        Some(e) => {
            eprintln!("✗ {} failed: {}", report.flow_id, e);
            if report.rolled_back {
                eprintln!("  Finished steps were rolled back.");
            }
        }
    }
    Ok(report.is_success())
}

fn print_event(event: &Event) {
    match event {
        Event::StepChange(p) => println!("==> {}", p.to_step),
        Event::TaskStart(p) => println!("  -> {} ({})", p.task_id, p.task_type),
        Event::TaskError(p) => println!(
            "  !! {}: {}",
            p.task_id,
            p.error.as_deref().unwrap_or("failed")
        ),
        Event::TaskRolledBack(p) => println!("  <- rolled back {}", p.task_id),
        Event::Progress(p) => println!("     [{:>3.0}%] {}", p.progress * 100.0, p.message),
        Event::FlowComplete(p) => println!("==> flow '{}' complete", p.flow_id),
        Event::TaskComplete(_) | Event::Log(_) => {}
    }
}

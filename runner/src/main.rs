use clap::{CommandFactory, Parser};
use nvbench_runner::{
    builder::Builder,
    cli::{Cli, Selection},
    config::{ConfigErrors, HarnessConfig},
    executors::LocalExecutor,
    harness::{HarnessError, Plan, Session},
};
use once_cell::sync::Lazy;
use std::{
    error::Error,
    io,
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

// set from the Ctrl-C handler, polled by the executor
static CANCELLED: Lazy<Arc<AtomicBool>> = Lazy::new(|| Arc::new(AtomicBool::new(false)));

fn apply_overrides(cli: &Cli, config: &mut HarnessConfig) {
    if let Some(dir) = &cli.csv {
        config.report.dir = Some(dir.clone());
    }
    if cli.no_csv {
        config.report.dir = None;
    }
    if cli.no_topology {
        config.topology.enabled = false;
    }
    if let Some(delay_ns) = cli.delay_ns {
        config.defaults.delay_ns = delay_ns;
    }
    if cli.partial_means {
        config.report.partial_means = true;
    }
}

fn run(cli: Cli) -> Result<(), HarnessError> {
    let mut config = HarnessConfig::load(&cli.config)?;
    apply_overrides(&cli, &mut config);

    if config.preflight_checks() {
        return Err(ConfigErrors::Preflight.into());
    }

    let selection = Selection::from_tokens(&cli.tokens, &config)?;

    if selection.build {
        Builder::new(&config.defaults.make).build_all(
            &config.tag,
            selection
                .benchmarks
                .iter()
                .filter_map(|name| config.benchmark(name)),
        );
    }
    if !selection.run {
        return Ok(());
    }

    let session = Session::from_config(&config, &selection)?;
    let mut plan = Plan::new(&config, &selection, &session.meta)?;

    let cancel = CANCELLED.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        warn!("Interrupted, stopping after the current run is killed");
        cancel.store(true, Ordering::SeqCst);
    }) {
        warn!("Failed to install the Ctrl-C handler: {e}");
    }

    let executor = LocalExecutor::new(CANCELLED.clone())
        .clock(config.defaults.clock)
        .timeout(config.defaults.timeout.map(Duration::from_secs))
        .sample_memory(
            cli.sample_memory
                .then(|| Duration::from_millis(config.defaults.sample_interval_ms)),
        );

    let summary = session.run(&mut plan, executor, &mut io::stdout().lock())?;
    info!(
        failures = summary.failures,
        csv = ?summary.csv,
        "Matrix completed in {} seconds",
        summary.elapsed.as_secs_f64()
    );

    Ok(())
}

fn log_error_chain(e: &dyn Error) {
    error!("{e}");

    let mut source = e.source();
    while let Some(cause) = source {
        error!("  caused by: {cause}");
        source = cause.source();
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    fmt().with_env_filter(filter).init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ HarnessError::Config(_)) => {
            log_error_chain(&e);
            eprintln!("{}", Cli::command().render_usage());
            ExitCode::from(2)
        }
        Err(e) => {
            log_error_chain(&e);
            ExitCode::FAILURE
        }
    }
}

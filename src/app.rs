//! Wiring and scheduling.
//!
//! Four concurrent activities share one graph lock: the blocking event loop
//! (the sole event consumer, on a dedicated thread), the signal handler, the
//! optional interval reporter and the periodic liveness sweep. The tokio tasks
//! only ever hold the lock for the duration of a report or a sweep, both of
//! which are bounded by the number of known commands/pids, not by event rate.

use std::fs::File;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::time::{interval_at, Instant};

use crate::cli::{Cli, Options};
use crate::connector::{self, EventSource};
use crate::prelude::*;
use crate::report::{ReportOptions, Reporter};
use crate::tracker::Tracker;

/// How often records of pids whose exit we missed are collected.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub async fn run() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // --help/--version land here too; only real parse errors are fatal
            let fatal = err.use_stderr();
            let _ = err.print();
            std::process::exit(if fatal { 1 } else { 0 });
        }
    };
    let opts = cli.resolve()?;

    init_logging();

    let reporter = Arc::new(Reporter::new(
        open_output(&opts)?,
        ReportOptions {
            sort: opts.sort,
            top: opts.top,
            raw: opts.raw,
        },
    ));
    let tracker = Arc::new(Tracker::new());

    // Subscribe before spawning anything so a privilege problem is the only
    // thing the operator sees.
    let source = EventSource::connect()
        .context("cannot subscribe to kernel process events (root privileges are required)")?;
    info!("watching process events (report via SIGUSR1, reset via SIGUSR2)");

    spawn_signal_handler(tracker.clone(), reporter.clone())?;

    if let Some(every) = opts.interval {
        tokio::spawn(report_periodically(
            every,
            tracker.clone(),
            reporter.clone(),
            opts.clear_after_report,
        ));
    }

    tokio::spawn(sweep_periodically(tracker.clone()));

    // The event loop owns a thread of its own: the netlink recv blocks
    // indefinitely and must never wait behind a tokio task.
    let event_loop = tokio::task::spawn_blocking(move || -> Result<()> {
        connector::raise_priority();
        let mut source = source;
        loop {
            let event = source.next_event()?;
            tracker.handle_event(event);
        }
    });

    event_loop
        .await
        .context("the event loop terminated abnormally")?
}

fn init_logging() {
    let level = std::env::var("EXECTOP_LOG")
        .ok()
        .and_then(|level| level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);

    let config = simplelog::ConfigBuilder::new()
        .set_time_level(log::LevelFilter::Debug)
        .build();

    let _ = simplelog::TermLogger::init(
        level,
        config,
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    );
}

fn open_output(opts: &Options) -> Result<Box<dyn Write + Send>> {
    match &opts.output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("cannot create output file {}", path.display()))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(std::io::stderr())),
    }
}

struct Signals {
    usr1: Signal,
    usr2: Signal,
    term: Signal,
    int: Signal,
}

fn spawn_signal_handler(tracker: Arc<Tracker>, reporter: Arc<Reporter>) -> Result<()> {
    let mut signals = Signals {
        usr1: signal(SignalKind::user_defined1()).context("installing the SIGUSR1 handler")?,
        usr2: signal(SignalKind::user_defined2()).context("installing the SIGUSR2 handler")?,
        term: signal(SignalKind::terminate()).context("installing the SIGTERM handler")?,
        int: signal(SignalKind::interrupt()).context("installing the SIGINT handler")?,
    };

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = signals.usr1.recv() => {
                    reporter.emit(&tracker);
                }
                _ = signals.usr2.recv() => {
                    reporter.emit(&tracker);
                    tracker.reset();
                    debug!("counters cleared on SIGUSR2");
                }
                _ = signals.term.recv() => shutdown("SIGTERM", &tracker, &reporter),
                _ = signals.int.recv() => shutdown("SIGINT", &tracker, &reporter),
            }
        }
    });
    Ok(())
}

/// Final report, then out. Nothing needs draining: an event in flight is worth
/// less than a prompt exit.
fn shutdown(signal_name: &str, tracker: &Tracker, reporter: &Reporter) -> ! {
    reporter.emit(tracker);
    reporter.note(&format!("Received {signal_name}. Exiting."));
    std::process::exit(0);
}

async fn report_periodically(
    every: Duration,
    tracker: Arc<Tracker>,
    reporter: Arc<Reporter>,
    clear_after_report: bool,
) {
    let mut ticker = interval_at(Instant::now() + every, every);
    loop {
        ticker.tick().await;
        reporter.emit(&tracker);
        if clear_after_report {
            tracker.reset();
        }
    }
}

async fn sweep_periodically(tracker: Arc<Tracker>) {
    let mut ticker = interval_at(Instant::now() + SWEEP_INTERVAL, SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        let removed = tracker.sweep();
        if removed > 0 {
            debug!("liveness sweep removed {removed} stale process records");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options_with_output(output: Option<std::path::PathBuf>) -> Options {
        Options {
            output,
            sort: crate::report::SortKey::Count,
            interval: None,
            raw: false,
            clear_after_report: false,
            top: 10,
        }
    }

    #[test]
    fn test_open_output_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exectop.out");
        let mut out = open_output(&options_with_output(Some(path.clone()))).unwrap();
        out.write_all(b"report\n").unwrap();
        out.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "report\n");
    }

    #[test]
    fn test_open_output_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no/such/dir/exectop.out");
        let err = match open_output(&options_with_output(Some(path))) {
            Err(e) => e,
            Ok(_) => panic!("expected open_output to fail for missing directory"),
        };
        assert!(err.to_string().contains("cannot create output file"));
    }

    #[test]
    fn test_open_output_defaults_to_stderr() {
        assert!(open_output(&options_with_output(None)).is_ok());
    }
}

use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::{bail, Context};
use log::debug;

use reconwatch::address::TargetResolver;
use reconwatch::input::{Config, Opts, ScanConfig};
use reconwatch::monitor::Monitor;
use reconwatch::notify::telegram::TelegramNotifier;
use reconwatch::notify::{Notifier, RetryPolicy};
use reconwatch::scanner::probe::ProbeEngine;
use reconwatch::scanner::rate_limit::RateLimiter;
use reconwatch::scanner::Scanner;
use reconwatch::session::{ScanSession, SessionOutcome};
use reconwatch::tui::format_reports;
use reconwatch::{detail, output, warning};

/// File descriptors kept free for DNS, the notifier and stdio.
const RESERVED_DESCRIPTORS: u64 = 100;

#[cfg(not(tarpaulin_include))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut opts = Opts::read();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opts.monitor { "info" } else { "warn" }),
    )
    .init();

    let config = Config::read(opts.config_path.clone()).context("reading configuration file")?;
    opts.merge(&config);
    let settings = opts.scan_config()?;
    let quiet = opts.greppable || opts.json;

    if opts.test_telegram {
        return test_telegram(&settings).await;
    }
    if opts.addresses.is_empty() {
        bail!("No targets given. Pass addresses, networks or hosts with -a, or set `addresses` in the configuration file.");
    }

    #[cfg(unix)]
    let workers = infer_workers(&opts, settings.workers, adjust_ulimit_size(&opts));
    #[cfg(not(unix))]
    let workers = settings.workers;
    debug!("Scanning with {workers} workers at {} probes/s", settings.rate);

    let notifier = match &settings.telegram {
        Some(telegram) => {
            let backend = TelegramNotifier::new(telegram.clone())?;
            Some(Notifier::spawn(Arc::new(backend), RetryPolicy::default()))
        }
        None => None,
    };

    let probe = ProbeEngine::new(
        settings.timeout,
        settings.banner_timeout,
        settings.tries,
        settings.grab_banners,
    );
    let scanner = Scanner::new(Arc::new(probe), workers)
        .with_rate_limiter(Arc::new(RateLimiter::new(settings.rate, settings.burst)))
        .with_max_backlog(settings.max_backlog);

    let cancel = scanner.cancellation_token();
    let (greppable, accessible) = (quiet, opts.accessible);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warning!("Interrupted, finishing probes in flight.", greppable, accessible);
            cancel.cancel();
        }
    });

    let resolver = TargetResolver::with_dns(settings.max_hosts, &opts.resolver).await;
    let mut session = ScanSession::new(opts.addresses.clone(), settings.plan.clone(), scanner)
        .with_resolver(resolver)
        .with_exclusions(opts.exclude_addresses.clone().unwrap_or_default())
        .notify_empty(opts.notify_empty);

    let scanned = if let Some(interval) = settings.interval {
        let mut monitor = Monitor::new(session, interval);
        if let Some(notifier) = &notifier {
            monitor = monitor.with_notifier(notifier.handle());
        }
        let rounds = monitor.run().await;
        detail!(
            format!(
                "Monitoring stopped after {rounds} rounds, {} changes observed.",
                monitor.history().count()
            ),
            quiet,
            opts.accessible
        );
        Ok(())
    } else {
        if let Some(notifier) = &notifier {
            session = session.with_notifier(notifier.handle());
        }
        let scanned = session.run().await;
        drop(session);
        scanned
            .map_err(anyhow::Error::from)
            .and_then(|outcome| print_outcome(&outcome, &settings, &opts))
    };

    if let Some(notifier) = notifier {
        let report = notifier.shutdown().await;
        debug!("{} notifications delivered", report.delivered);
        for (_, error) in &report.undelivered {
            warning!(
                format!("A notification could not be delivered: {error}"),
                quiet,
                opts.accessible
            );
        }
    }

    scanned
}

fn print_outcome(outcome: &SessionOutcome, settings: &ScanConfig, opts: &Opts) -> anyhow::Result<()> {
    let quiet = opts.greppable || opts.json;
    for error in &outcome.resolution_errors {
        warning!(error.to_string(), quiet, opts.accessible);
    }

    println!(
        "{}",
        format_reports(&outcome.reports, settings.output, opts.accessible)?
    );
    output!(
        format!(
            "{} hosts scanned, {} probes sent{}.",
            outcome.complete_reports().count(),
            outcome.stats.dispatched,
            if outcome.stats.cancelled {
                ", scan cancelled"
            } else {
                ""
            }
        ),
        quiet,
        opts.accessible
    );
    Ok(())
}

async fn test_telegram(settings: &ScanConfig) -> anyhow::Result<()> {
    let Some(telegram) = &settings.telegram else {
        bail!("Telegram is not configured. Set --telegram-token and --telegram-chat-id.");
    };

    let bot = TelegramNotifier::new(telegram.clone())?
        .test_connection()
        .await
        .context("Telegram connection test failed")?;
    output!(format!("Test message sent by @{bot}."));
    Ok(())
}

/// Raises the open file limit when asked to and returns the current soft limit.
#[cfg(unix)]
fn adjust_ulimit_size(opts: &Opts) -> u64 {
    use rlimit::Resource;

    if let Some(limit) = opts.ulimit {
        if Resource::NOFILE.set(limit, limit).is_ok() {
            detail!(
                format!("Automatically increasing ulimit value to {limit}."),
                opts.greppable,
                opts.accessible
            );
        } else {
            warning!(
                "ERROR. Failed to set ulimit value.",
                opts.greppable,
                opts.accessible
            );
        }
    }

    Resource::NOFILE.get().map_or(u64::MAX, |(soft, _)| soft)
}

/// Lowers the worker count when the open file limit cannot hold one socket
/// per worker.
fn infer_workers(opts: &Opts, workers: NonZeroUsize, ulimit: u64) -> NonZeroUsize {
    let available = ulimit.saturating_sub(RESERVED_DESCRIPTORS);
    let requested = workers.get() as u64;
    if requested <= available {
        return workers;
    }

    let lowered = usize::try_from(available.max(ulimit / 2))
        .ok()
        .and_then(NonZeroUsize::new)
        .unwrap_or(NonZeroUsize::MIN);
    warning!(
        format!(
            "File limit of {ulimit} is too low for {requested} workers, using {lowered}. Raise it with --ulimit."
        ),
        opts.greppable,
        opts.accessible
    );
    lowered
}

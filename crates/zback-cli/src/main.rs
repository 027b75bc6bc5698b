mod cli;
mod signal;

use std::io::Write;
use std::process::ExitCode;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use clap::Parser;

use zback_core::backup::{self, planner};
use zback_core::compress::Compressor;
use zback_core::config::{CryptoOptions, FailurePolicy, JobOptions};
use zback_core::error::{Result, ZbackError};
use zback_core::list::{self, ListFilters};
use zback_core::restore::{self, RestoreRequest};
use zback_core::retry::RetryPolicy;
use zback_core::storage::open_destinations;
use zback_core::zfs::{self, ReceiveOptions};

use cli::{Cli, Commands, PipelineArgs};

/// Exit code for the planner's "nothing to do" verdict: expected, but
/// distinguishable from success for scripting.
const EXIT_NO_OP: u8 = 2;

fn main() -> ExitCode {
    let args = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.clone())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    signal::install_signal_handlers();

    match dispatch(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_no_op() => {
            eprintln!("{e}");
            ExitCode::from(EXIT_NO_OP)
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn dispatch(args: Cli) -> Result<()> {
    let stdout = std::io::stdout();
    match args.command {
        Commands::Send {
            pipeline,
            from,
            increment,
            failure_policy,
            target,
            destinations,
        } => {
            let mut opts = job_options(&pipeline)?;
            opts.failure_policy = FailurePolicy::from_flag(&failure_policy)?;
            run_send(
                &target,
                &destinations,
                from.as_deref(),
                increment,
                &opts,
            )
        }
        Commands::Receive {
            pipeline,
            from,
            auto,
            force,
            properties,
            source,
            destinations,
            target,
        } => {
            let opts = job_options(&pipeline)?;
            let request = RestoreRequest {
                source,
                target,
                auto,
                incremental_from: from,
                receive: ReceiveOptions {
                    force,
                    properties: parse_properties(&properties)?,
                },
            };
            let summary = restore::run(&request, &destinations, &opts, &signal::SHUTDOWN)?;
            eprintln!(
                "Restored {} manifest(s), {} volume(s), {} bytes",
                summary.jobs, summary.volumes, summary.bytes_written
            );
            Ok(())
        }
        Commands::List {
            volume_name,
            before,
            after,
            json,
            destinations,
        } => {
            let filters = ListFilters {
                volume_name,
                before: before.as_deref().map(parse_time).transpose()?,
                after: after.as_deref().map(parse_time).transpose()?,
            };
            let dests = open_destinations(&destinations, Duration::from_secs(60))?;
            let mut out = stdout.lock();
            list::run(
                &dests,
                &filters,
                json,
                &mut out,
                &RetryPolicy::default(),
                Some(&signal::SHUTDOWN),
            )?;
            Ok(())
        }
        Commands::Version { json } => {
            let mut out = stdout.lock();
            if json {
                writeln!(
                    out,
                    "{}",
                    serde_json::json!({ "version": env!("CARGO_PKG_VERSION") })
                )?;
            } else {
                writeln!(out, "zback v{}", env!("CARGO_PKG_VERSION"))?;
            }
            Ok(())
        }
    }
}

fn run_send(
    target: &str,
    destinations: &str,
    from: Option<&str>,
    increment: bool,
    opts: &JobOptions,
) -> Result<()> {
    let plan = if increment {
        // Smart mode: `target` is a bare dataset; reconcile with the
        // manifests already at the destination(s).
        let local = zfs::list_snapshots(target)?;
        let dests = open_destinations(destinations, opts.request_timeout)?;
        let remote = list::collect_mirrored(&dests, &opts.retry, Some(&signal::SHUTDOWN))?;
        planner::plan_increment(target, &local, &remote)?
    } else {
        backup::resolve_manual_plan(target, from)?
    };

    let summary = backup::run(&plan, destinations, opts, &signal::SHUTDOWN)?;
    eprintln!(
        "Sent {} volume(s), {} -> {} bytes, committed to: {}",
        summary.volumes,
        summary.raw_bytes,
        summary.stored_bytes,
        summary.committed.join(", "),
    );
    for (uri, error) in &summary.failed {
        eprintln!("Partial failure: {uri}: {error}");
    }
    Ok(())
}

fn job_options(args: &PipelineArgs) -> Result<JobOptions> {
    let opts = JobOptions {
        working_dir: args
            .working_directory
            .as_ref()
            .map(Into::into)
            .unwrap_or_else(std::env::temp_dir),
        separator: args.separator.clone(),
        volume_size: args.volume_size * 1024 * 1024,
        max_parallel: args.max_parallel,
        retry: RetryPolicy {
            max_retries: args.max_retries,
            base_delay_ms: 500,
            max_delay_ms: args.max_backoff * 1000,
        },
        request_timeout: Duration::from_secs(args.request_timeout),
        compressor: Compressor::from_flag(&args.compressor, args.compression_level)?,
        crypto: CryptoOptions {
            public_keyring: args.public_keyring.as_ref().map(Into::into),
            secret_keyring: args.secret_keyring.as_ref().map(Into::into),
            encrypt_to: args.encrypt_to.clone(),
            sign_from: args.sign_from.clone(),
        },
        ..Default::default()
    };
    opts.validate()?;
    Ok(opts)
}

fn parse_properties(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| {
                    ZbackError::InvalidInput(format!("-o expects prop=value, got '{pair}'"))
                })
        })
        .collect()
}

/// Accept RFC 3339 or its naive `YYYY-MM-DDTHH:MM:SS` prefix (UTC assumed).
fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Ok(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .map(|t| t.and_utc())
        .map_err(|e| ZbackError::InvalidInput(format!("cannot parse time '{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_time_accepts_both_forms() {
        let naive = parse_time("2026-08-02T10:30:00").unwrap();
        assert_eq!(naive.timestamp(), 1_785_666_600);
        let full = parse_time("2026-08-02T10:30:00Z").unwrap();
        assert_eq!(naive, full);
        assert!(parse_time("yesterday").is_err());
    }

    #[test]
    fn parse_properties_requires_equals() {
        let ok = parse_properties(&["origin=tank/data@b".to_string()]).unwrap();
        assert_eq!(ok, vec![("origin".to_string(), "tank/data@b".to_string())]);
        assert!(parse_properties(&["mountpoint".to_string()]).is_err());
    }
}

//! This is a load generator binary which runs PUT and GET benchmarks against an object store.
//!
//! A YAML configuration lists one or more runs. Each run issues a fixed number of requests
//! with a given object size, under either a *capacity* policy (release everything, bounded by
//! the connection limit) or a *grouped* policy (release fixed-size waves back to back).
//!
//! Every request is verified against the MD5 checksum of its payload. The final report keeps
//! transport failures and integrity failures apart.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use argh::FromArgs;
use indicatif::{ProgressBar, ProgressStyle};
use loadgen::report::{print_report, print_totals};
use loadgen::{Error, JwtSigner, RunCoordinator, Signer};
use tokio_util::sync::CancellationToken;
use yansi::Paint;

use crate::config::Config;

mod config;
mod observability;

/// Benchmarks an object store with bounded-concurrency PUT and GET runs
#[derive(Debug, FromArgs)]
pub struct Args {
    /// path to the yaml configuration file
    #[argh(option, short = 'c')]
    pub config: PathBuf,

    /// only perform the run with this label
    #[argh(option, short = 'l')]
    pub label: Option<String>,

    /// print the reports as JSON instead of text
    #[argh(switch)]
    pub json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = argh::from_env();
    observability::initialize_tracing();

    let config_file = std::fs::File::open(&args.config).context("failed to open config file")?;
    let config: Config =
        serde_yaml::from_reader(config_file).context("failed to parse config YAML")?;
    tracing::debug!(?config);

    let signer = config.signer.as_ref().map(|signer| {
        let mut jwt = JwtSigner::new(&signer.secret);
        if let Some(expiry) = signer.expiry {
            jwt = jwt.expiry(expiry);
        }
        Arc::new(jwt) as Arc<dyn Signer>
    });

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, finishing the current wave");
                cancel.cancel();
            }
        }
    });

    let mut reports = Vec::new();
    let mut empty_runs = 0;

    let runs = config
        .runs
        .into_iter()
        .filter(|run| args.label.as_ref().is_none_or(|label| &run.label == label));

    for run in runs {
        if cancel.is_cancelled() {
            break;
        }

        let object_size =
            usize::try_from(run.object_size.as_u64()).context("object size too large")?;
        let mut builder = RunCoordinator::builder(&run.label, &config.endpoint)
            .bucket(&config.bucket)
            .object_prefix(&config.object_prefix)
            .method(run.method)
            .object_size(object_size)
            .unique_payloads(run.unique_payloads)
            .backend(run.backend)
            .timeout(config.timeout)
            .cancellation(cancel.clone());
        if let Some(signer) = &signer {
            builder = builder.signer(Arc::clone(signer));
        }
        let coordinator = builder.build();

        let bar = ProgressBar::new_spinner()
            .with_style(ProgressStyle::with_template("{spinner} {msg} {elapsed}")?)
            .with_message(format!("Running {}:", run.label));
        bar.enable_steady_tick(Duration::from_millis(100));

        let result = coordinator.run(run.total_count, run.mode).await;
        bar.finish_and_clear();

        match result {
            Ok(report) => {
                if !args.json {
                    print_report(&report);
                }
                reports.push(report);
            }
            Err(err @ Error::NoSamples { .. }) => {
                println!();
                println!(
                    "{} {}: {}",
                    "## Run".bold(),
                    run.label.as_str().bold().blue(),
                    err.to_string().bold().red()
                );
                empty_runs += 1;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("run `{}` failed", run.label));
            }
        }
    }

    if args.json {
        serde_json::to_writer_pretty(std::io::stdout(), &reports)?;
        println!();
    } else if reports.len() > 1 {
        print_totals(&reports);
    }

    if empty_runs > 0 {
        anyhow::bail!("{empty_runs} run(s) had no successful requests");
    }

    Ok(())
}

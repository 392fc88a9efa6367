// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runs the Hyper-V enlightenment probe against a simulated host.

use anyhow::Context;
use clap::Parser;
use hvprobe::engine::{EngineState, FailReason};
use hvprobe::sim::SimHost;
use hvprobe::{CheckId, Engine};
use hvprobe_config::Config;
use slog::{info, o, Drain};
use strum::IntoEnumIterator;

#[derive(clap::Parser, Debug)]
#[clap(about, version)]
struct Args {
    /// Probe configuration file. Without one, a conforming host is probed
    /// with the default options.
    #[clap(value_name = "CONFIG", action)]
    config: Option<String>,

    /// List the checks the probe evaluates, then exit.
    #[clap(long, action)]
    list_checks: bool,

    /// Print the effective configuration as TOML, then exit.
    #[clap(long, action)]
    dump_config: bool,
}

fn build_log() -> (slog::Logger, slog_async::AsyncGuard) {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
    (slog::Logger::root(drain.fuse(), o!()), guard)
}

fn list_checks() {
    for id in CheckId::iter() {
        println!("{:<24} {:<18} {}", id, id.stage(), id.description());
    }
}

fn main() -> anyhow::Result<()> {
    let Args { config, list_checks: list, dump_config } = Args::parse();

    if list {
        list_checks();
        return Ok(());
    }

    let config = match config {
        Some(path) => hvprobe_config::parse(&path)?,
        None => Config::default(),
    };

    if dump_config {
        print!(
            "{}",
            toml::to_string(&config).context("failed to serialize config")?
        );
        return Ok(());
    }

    let (log, log_guard) = build_log();
    let host = SimHost::new(&log, &config.host)
        .context("failed to build simulated host")?;

    let outcome = Engine::new(&host, config.probe, config.expect, &log).run();
    let stats = outcome.stats();
    info!(log, "run finished";
          "state" => ?outcome.state,
          "profile" => ?outcome.profile);

    // Flush the async drain so the summary lands after the per-check lines.
    drop(log);
    drop(log_guard);

    println!(
        "\n{} passed; {} failed; {} skipped; {} not run",
        stats.tests_passed,
        stats.tests_failed,
        stats.tests_skipped,
        stats.tests_not_run
    );
    for id in &stats.failed_test_cases {
        println!("    {id}: {}", id.description());
    }
    match &outcome.state {
        EngineState::Done => println!("result: ok"),
        EngineState::Failed(FailReason::Fatal(e)) => {
            println!("result: aborted ({e})")
        }
        EngineState::Failed(FailReason::Assertions { failed }) => {
            println!("result: FAILED ({failed} checks)")
        }
        state => println!("result: stopped in {state:?}"),
    }

    std::process::exit(outcome.exit_code());
}

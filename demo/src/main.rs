// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod logger;

use anyhow::Context;
use clap::builder::RangedU64ValueParser;
use clap::{ArgAction, Parser};
use std::io::{self, Write};
use std::process;
use strand::{Config, DEFAULT_STACK_SIZE, Scheduler, Task};

/// Spawns one task per value. Every task prints its value and yields, `--iterations` times, so
/// the output shows the tasks taking turns.
#[derive(Debug, Parser)]
#[clap(version)]
struct Demo {
    /// Enables verbose logging
    #[clap(short, long, action = ArgAction::Count)]
    verbose: u8,
    /// How many times every task prints its value
    #[clap(short, long, env = "STRAND_ITERATIONS", default_value_t = 10)]
    iterations: usize,
    /// Stack size of every task, in bytes
    #[clap(short, long, env = "STRAND_STACK_SIZE", default_value_t = DEFAULT_STACK_SIZE,
        value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    stack_size: usize,
    /// Values printed by the tasks, one task per value
    #[clap(default_values_t = [44, 66])]
    values: Vec<i64>,
}

fn main() {
    if let Err(err) = run() {
        tracing::error!("{err:?}");
        process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let demo = Demo::parse();

    logger::init(demo.verbose);
    tracing::debug!(?demo, "starting");

    let sched = Scheduler::new(Config::default().with_default_stack_size(demo.stack_size));

    for value in demo.values {
        let iterations = demo.iterations;
        sched
            .build_task()
            .spawn(move |task| print_value(task, value, iterations))
            .with_context(|| format!("failed to spawn task for value {value}"))?;
    }

    let stats = sched.run();
    tracing::info!(
        switches = stats.switches,
        yields = stats.yields,
        exits = stats.exits,
        "all tasks finished"
    );

    sched.shutdown();
    Ok(())
}

fn print_value(task: &Task, value: i64, iterations: usize) {
    // Entered only around the work between two yields, never across a suspension.
    let span = tracing::info_span!("print_value", value);

    for i in 0..iterations {
        let res = span.in_scope(|| {
            tracing::trace!(i, "printing");
            writeln!(io::stdout().lock(), "{value}")
        });
        if let Err(err) = res {
            tracing::warn!("failed to write to stdout: {err}");
            break;
        }

        if let Err(err) = task.yield_now() {
            tracing::error!("failed to yield: {err}");
            process::exit(1);
        }
    }

    // unwinds this stack, dropping `span` on the way out
    let Err(err) = task.exit();
    tracing::error!("failed to exit: {err}");
    process::exit(1);
}

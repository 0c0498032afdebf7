// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool to dispatch batches of tasks on a thread pool.

use clap::Parser;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use std::hint::black_box;
use std::num::NonZeroUsize;
use std::time::Instant;
use tasklight::{CpuPinningPolicy, ThreadCount, ThreadPoolBuilder};

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let pool = ThreadPoolBuilder {
        num_threads: match cli.num_threads {
            Some(num_threads) => ThreadCount::Count(num_threads),
            None => ThreadCount::AvailableParallelism,
        },
        cpu_pinning: CpuPinningPolicy::IfSupported,
    }
    .build()
    .expect("failed to spawn the thread pool");

    println!(
        "dispatching {} tasks on {} worker threads",
        cli.num_tasks,
        pool.thread_count()
    );

    // The workload sizes follow a uniform distribution, fixed by a constant
    // seed for reproducibility.
    let mut rng = ChaCha12Rng::seed_from_u64(42);
    let start = Instant::now();
    let handles = (0..cli.num_tasks)
        .map(|_| {
            let rounds = rng.random_range(1..=cli.max_rounds);
            pool.dispatch(move || churn(rounds))
                .expect("the pool is not stopped")
        })
        .collect::<Vec<_>>();
    let dispatched = start.elapsed();

    let checksum = handles
        .iter()
        .map(|handle| handle.get().expect("task panicked"))
        .sum::<u64>();
    let completed = start.elapsed();

    println!("checksum = {checksum}");
    println!("dispatched in {dispatched:?}, completed in {completed:?}");
}

/// Spins through the given number of arithmetic rounds.
fn churn(rounds: u64) -> u64 {
    (0..rounds).map(|i| black_box(i) * i).sum()
}

/// CLI tool to dispatch batches of tasks on a thread pool.
#[derive(Parser, Debug)]
#[command(version)]
struct Cli {
    /// Number of worker threads. Defaults to the available parallelism.
    #[arg(long)]
    num_threads: Option<NonZeroUsize>,

    /// Number of tasks to dispatch.
    #[arg(long, default_value_t = 1_000)]
    num_tasks: usize,

    /// Maximum number of arithmetic rounds per task.
    #[arg(long, default_value_t = 100_000)]
    max_rounds: u64,
}

// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Example that dispatches a batch of tasks and sums their results.

use tasklight::{CpuPinningPolicy, ThreadCount, ThreadPoolBuilder};

fn main() {
    let pool = ThreadPoolBuilder {
        num_threads: ThreadCount::try_from(4).unwrap(),
        cpu_pinning: CpuPinningPolicy::No,
    }
    .build()
    .expect("failed to spawn the thread pool");

    let handles = (0..10u64)
        .map(|i| pool.dispatch(move || i * i).unwrap())
        .collect::<Vec<_>>();

    let sum = handles.iter().map(|handle| handle.get().unwrap()).sum::<u64>();
    println!("sum of squares = {sum}");
}

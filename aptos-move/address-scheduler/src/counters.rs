// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use once_cell::sync::Lazy;
use prometheus::{
    exponential_buckets, register_histogram, register_int_counter, Histogram, IntCounter,
};

fn wait_time_buckets() -> Vec<f64> {
    exponential_buckets(/*start=*/ 1e-6, /*factor=*/ 2.0, /*count=*/ 30).unwrap()
}

/// Count of times a lower-index transaction forced the owner of an address to abort.
pub static PRIORITY_INVERSION_PREEMPTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "aptos_address_scheduler_priority_inversion_preemptions",
        "Number of address owners aborted in favor of a lower-index transaction"
    )
    .unwrap()
});

/// Count of speculative executions whose commit was refused and that had to be re-executed.
pub static SPECULATIVE_RETRY_COUNT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "aptos_address_scheduler_speculative_retry_count",
        "Number of transaction incarnations discarded and re-executed"
    )
    .unwrap()
});

pub static ACQUIRE_WAIT_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "aptos_address_scheduler_acquire_wait_seconds",
        "Time a task spent parked waiting for address ownership",
        wait_time_buckets(),
    )
    .unwrap()
});

pub static COMMIT_WAIT_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "aptos_address_scheduler_commit_wait_seconds",
        "Time a task spent parked waiting for its commit turn",
        wait_time_buckets(),
    )
    .unwrap()
});

pub static TASK_EXECUTE_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "aptos_address_scheduler_task_execute_seconds",
        "Time spent in a single execution of a transaction",
        exponential_buckets(/*start=*/ 1e-6, /*factor=*/ 2.0, /*count=*/ 30).unwrap(),
    )
    .unwrap()
});

pub static PARALLEL_EXECUTION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "aptos_address_scheduler_parallel_execution_seconds",
        "Time spent executing a batch in parallel"
    )
    .unwrap()
});

pub static SEQUENTIAL_EXECUTION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "aptos_address_scheduler_sequential_execution_seconds",
        "Time spent executing a batch sequentially"
    )
    .unwrap()
});

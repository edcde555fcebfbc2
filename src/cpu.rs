//! CPU backend: worker groups on OS threads.
//!
//! Every lane hosts one group of `workers_per_group` threads sharing an
//! [`AtomicF32`] accumulator and a [`Barrier`]. Local worker 0 pulls the next
//! query index from a `flume` channel, zeroes the accumulator and publishes
//! the query; the first barrier makes both visible to the group. Each worker
//! reduces its strided share of the sample privately, adds it atomically, and
//! the second barrier guarantees worker 0 reads the complete sum.
//!
//! No worker reaches a barrier before every thread of the batch has been
//! spawned, so a failed spawn releases the threads already started instead of
//! leaving them waiting for group members that never arrive.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Barrier;
use std::thread;

use tracing::{debug, debug_span, warn};

use crate::atomic_float::AtomicF32;
use crate::config::KdeConfig;
use crate::error::{KdeError, Result};
use crate::kernel::{contribution, scale_factor};

/// Published instead of a query index once the channel is drained.
const NO_QUERY: usize = usize::MAX;

/// Kernel contribution of a sample point to a query, `K((query - xj) / h)`.
type KernelFn = fn(f32, f32, f32) -> f32;

struct WorkerGroup {
    accumulator: AtomicF32,
    query: AtomicUsize,
    barrier: Barrier,
    width: usize,
}

/// State every worker of a batch sees.
#[derive(Clone, Copy)]
struct Batch<'a> {
    sample: &'a [f32],
    queries: &'a [f32],
    h: f32,
    scale: f32,
    kernel: KernelFn,
    output: &'a [AtomicF32],
    /// Set by any worker whose reduction panicked.
    failed: &'a AtomicBool,
}

impl WorkerGroup {
    fn new(width: usize) -> Self {
        Self {
            accumulator: AtomicF32::zero(),
            query: AtomicUsize::new(NO_QUERY),
            barrier: Barrier::new(width),
            width,
        }
    }

    fn run_worker(
        &self,
        local_id: usize,
        batch: Batch<'_>,
        jobs: Option<&flume::Receiver<usize>>,
        start: &flume::Receiver<()>,
    ) {
        if start.recv().is_err() {
            return;
        }
        loop {
            if local_id == 0 {
                let next = if batch.failed.load(Ordering::Acquire) {
                    NO_QUERY
                } else {
                    jobs.and_then(|rx| rx.recv().ok()).unwrap_or(NO_QUERY)
                };
                self.accumulator.store(0.0, Ordering::Relaxed);
                self.query.store(next, Ordering::Relaxed);
            }
            self.barrier.wait();

            let query = self.query.load(Ordering::Relaxed);
            if query == NO_QUERY {
                return;
            }
            // A panicking worker still meets its group at the barrier.
            let partial = catch_unwind(AssertUnwindSafe(|| {
                let xi = batch.queries[query];
                // Workers past the end of the sample contribute zero.
                batch
                    .sample
                    .iter()
                    .skip(local_id)
                    .step_by(self.width)
                    .map(|&xj| (batch.kernel)(xi, xj, batch.h))
                    .sum::<f32>()
            }))
            .unwrap_or_else(|_| {
                batch.failed.store(true, Ordering::Release);
                0.0
            });
            self.accumulator.fetch_add(partial, Ordering::AcqRel);
            self.barrier.wait();

            if local_id == 0 {
                let sum = self.accumulator.load(Ordering::Acquire);
                batch.output[query].fetch_add(sum * batch.scale, Ordering::Relaxed);
            }
        }
    }
}

/// Evaluates the density of `sample` at every point of `queries`.
///
/// Returns only once every group has finished. A worker that cannot be
/// spawned or that panics fails the whole batch.
pub fn estimate_at(sample: &[f32], queries: &[f32], h: f32, config: &KdeConfig) -> Result<Vec<f32>> {
    run_groups(sample, queries, h, config, contribution, |index| {
        thread::Builder::new().name(format!("kde-worker-{index}"))
    })
}

fn run_groups(
    sample: &[f32],
    queries: &[f32],
    h: f32,
    config: &KdeConfig,
    kernel: KernelFn,
    builder_for: impl Fn(usize) -> thread::Builder,
) -> Result<Vec<f32>> {
    crate::check_sample(sample, h)?;
    config.validate()?;
    if queries.is_empty() {
        return Ok(Vec::new());
    }

    let width = config.workers_per_group;
    let lanes = config.lanes.min(queries.len());
    let output: Vec<AtomicF32> = queries.iter().map(|_| AtomicF32::zero()).collect();
    let groups: Vec<WorkerGroup> = (0..lanes).map(|_| WorkerGroup::new(width)).collect();
    let failed = AtomicBool::new(false);
    let batch = Batch {
        sample,
        queries,
        h,
        scale: scale_factor(sample.len(), h),
        kernel,
        output: &output,
        failed: &failed,
    };

    let _span = debug_span!("cpu_kde", n = sample.len(), queries = queries.len()).entered();
    debug!(lanes, workers_per_group = width, "launching worker groups");

    let (submit, jobs) = flume::unbounded();
    let (open, start) = flume::unbounded();
    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(lanes * width);
        for (g, group) in groups.iter().enumerate() {
            for local_id in 0..width {
                let jobs = (local_id == 0).then(|| jobs.clone());
                let start = start.clone();
                let spawned = builder_for(g * width + local_id).spawn_scoped(scope, move || {
                    group.run_worker(local_id, batch, jobs.as_ref(), &start)
                });
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(err) => {
                        warn!(spawned = handles.len(), error = %err, "worker spawn failed");
                        // Disconnecting the gate sends the started workers home.
                        drop(open);
                        return Err(KdeError::Spawn(err));
                    }
                }
            }
        }
        drop(jobs);
        drop(start);

        let submitted = (0..queries.len())
            .try_for_each(|i| submit.send(i))
            .map_err(|_| KdeError::ChannelClosed);
        drop(submit);
        for _ in 0..handles.len() {
            // Every worker holds a receiver until it passes the gate.
            let _ = open.send(());
        }
        drop(open);

        let joined = handles
            .into_iter()
            .map(|handle| handle.join())
            .fold(Ok(()), |acc, joined| {
                acc.and(joined.map_err(|_| KdeError::WorkerPanicked))
            });
        submitted.and(joined)
    })?;

    if failed.load(Ordering::Acquire) {
        return Err(KdeError::WorkerPanicked);
    }
    Ok(output.into_iter().map(AtomicF32::into_inner).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::INV_SQRT_2PI;
    use crate::reference::estimate_at_f64;
    use approx::assert_relative_eq;

    fn config(workers: usize, lanes: usize) -> KdeConfig {
        KdeConfig::cpu().with_workers_per_group(workers).with_lanes(lanes)
    }

    #[test]
    fn more_workers_than_samples() {
        let y = estimate_at(&[0.0, 0.0, 0.0], &[0.0, 0.0, 0.0], 1.0, &config(16, 2)).unwrap();
        for v in y {
            assert_relative_eq!(v, INV_SQRT_2PI, max_relative = 1e-5);
        }
    }

    #[test]
    fn single_worker_single_lane() {
        let sample = [0.1, 0.4, -0.3, 1.2, 0.9];
        let y = estimate_at(&sample, &sample, 0.7, &config(1, 1)).unwrap();
        let expected = estimate_at_f64(&sample, &sample, 0.7);
        for (got, want) in y.iter().zip(expected) {
            assert_relative_eq!(*got as f64, want, max_relative = 1e-5);
        }
    }

    #[test]
    fn queries_need_not_be_the_sample() {
        let sample = [-1.0, 0.0, 1.0];
        let queries = [-5.0, -0.5, 0.0, 0.5, 5.0, 20.0];
        let y = estimate_at(&sample, &queries, 0.5, &config(2, 3)).unwrap();
        let expected = estimate_at_f64(&sample, &queries, 0.5);
        assert_eq!(y.len(), queries.len());
        for (got, want) in y.iter().zip(expected) {
            assert!((*got as f64 - want).abs() <= 1e-5 * want.max(1e-30) + 1e-12);
        }
    }

    #[test]
    fn no_queries_is_empty_output() {
        let y = estimate_at(&[1.0], &[], 1.0, &config(2, 2)).unwrap();
        assert!(y.is_empty());
    }

    fn explosive(query: f32, xj: f32, h: f32) -> f32 {
        if xj > 100.0 {
            panic!("unexpected outlier {xj}");
        }
        contribution(query, xj, h)
    }

    #[test]
    fn failed_spawn_releases_started_workers() {
        // Threads 0..3 start and wait at the gate; thread 3 cannot get its stack.
        let err = run_groups(&[0.0, 1.0], &[0.0, 1.0], 1.0, &config(4, 2), contribution, |index| {
            let builder = thread::Builder::new();
            if index >= 3 {
                builder.stack_size(1usize << 62)
            } else {
                builder
            }
        })
        .unwrap_err();
        assert!(matches!(err, KdeError::Spawn(_)));
    }

    #[test]
    fn panicking_worker_fails_the_batch() {
        let sample = [0.0, 1.0, 2.0, 1000.0];
        let queries: Vec<f32> = (0..32).map(|i| i as f32 * 0.1).collect();
        let err = run_groups(&sample, &queries, 1.0, &config(2, 3), explosive, |_| thread::Builder::new())
            .unwrap_err();
        assert!(matches!(err, KdeError::WorkerPanicked));
    }

    #[test]
    fn custom_kernel_hook_matches_public_entry_point() {
        let sample = [0.5, -0.25, 2.0];
        let hooked = run_groups(&sample, &sample, 0.8, &config(2, 2), contribution, |_| thread::Builder::new())
            .unwrap();
        assert_eq!(hooked, estimate_at(&sample, &sample, 0.8, &config(2, 2)).unwrap());
    }

    #[test]
    fn bad_bandwidth_is_rejected_before_spawning() {
        let err = estimate_at(&[1.0], &[1.0], 0.0, &config(2, 2)).unwrap_err();
        assert!(matches!(err, KdeError::InvalidBandwidth(_)));
    }
}

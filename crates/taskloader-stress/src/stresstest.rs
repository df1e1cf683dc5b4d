use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::future::{BoxFuture, FutureExt, join_all};
use sentry::{Hub, SentryFutureExt};
use sketches_ddsketch::DDSketch;
use taskloader_service::config::Config;
use taskloader_service::error::WorkError;
use taskloader_service::loader::{Loader, QueryOutcome, TaskContext, TaskDriver, TaskOrigin};
use taskloader_service::pools::Pools;
use tokio::sync::Semaphore;

use crate::workloads::{Workload, WorkloadsConfig};

/// Work that takes as long as its params say, keyed by workload and key.
#[derive(Debug, Default)]
pub struct SyntheticWork;

impl TaskDriver for SyntheticWork {
    type Key = (usize, u64);
    type Params = Duration;
    type Output = u64;
    type Progress = ();

    fn compute(
        &self,
        (workload, key): Self::Key,
        work: Duration,
        ctx: TaskContext<()>,
    ) -> BoxFuture<'static, Result<u64, WorkError>> {
        async move {
            tokio::select! {
                _ = ctx.cancelled() => Err(WorkError::Interrupted),
                _ = tokio::time::sleep(work) => Ok(key.wrapping_mul(workload as u64 + 1)),
            }
        }
        .boxed()
    }
}

#[derive(Default)]
struct WorkloadStats {
    durations: DDSketch,
    outcomes: BTreeMap<&'static str, usize>,
}

impl WorkloadStats {
    fn record(&mut self, outcome: Option<&QueryOutcome<u64>>, elapsed: Duration) {
        self.durations.add(elapsed.as_secs_f64());
        let kind = match outcome {
            Some(outcome) if outcome.origin() == Some(TaskOrigin::Joined) => "joined",
            Some(outcome) => outcome.kind(),
            None => "lost",
        };
        *self.outcomes.entry(kind).or_default() += 1;
    }
}

pub async fn perform_stresstest(
    config: &Config,
    pools: &Pools,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let loader = Loader::new(SyntheticWork, config, pools);
    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .map(Arc::new)
        .enumerate()
        .collect();

    // start processing the workloads once, as a warmup
    {
        let start = Instant::now();
        let futures = workloads.iter().map(|(index, workload)| {
            let loader = loader.clone();
            let key = (*index, 0);
            let work = workload.work;
            async move {
                let mut query = loader.submit(key, work)?;
                query.outcome().await;
                anyhow::Ok(())
            }
        });
        join_all(futures)
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;
        println!("Warmup: {:?}", start.elapsed());
    }
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (index, workload) in workloads {
        let loader = loader.clone();
        let deadline = tokio::time::Instant::now() + duration;

        let task = tokio::spawn(async move {
            let stats = Arc::new(Mutex::new(WorkloadStats::default()));
            let semaphore = Arc::new(Semaphore::new(workload.concurrency));
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            let mut submitted = 0;
            loop {
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let key = (index, workload.key_for(submitted));
                        let cancel = workload.cancels(submitted);
                        submitted += 1;

                        let loader = loader.clone();
                        let stats = Arc::clone(&stats);
                        let work = workload.work;

                        let hub = Arc::new(Hub::new_from_top(Hub::current()));
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);
                        hub.configure_scope(|scope| scope.set_span(Some(transaction.clone().into())));

                        let future = async move {
                            let start = Instant::now();
                            let outcome = match loader.submit(key, work) {
                                Ok(mut query) => {
                                    if cancel {
                                        query.cancel(Some("stresstest".into()), false);
                                    }
                                    query.outcome().await
                                }
                                Err(_) => None,
                            };
                            let elapsed = start.elapsed();
                            transaction.finish();

                            stats
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .record(outcome.as_ref(), elapsed);
                            drop(permit);
                        };
                        tokio::spawn(future.bind_hub(hub));
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // we only count finished queries, so wait for the in-flight ones
            let _permits = semaphore.acquire_many(workload.concurrency as u32).await;

            let stats = std::mem::take(&mut *stats.lock().unwrap_or_else(PoisonError::into_inner));
            (workload, stats)
        });
        tasks.push(task);
    }

    let finished_tasks = join_all(tasks).await;

    for (index, task) in finished_tasks.into_iter().enumerate() {
        let (workload, stats) = task?;
        let Workload {
            concurrency,
            keys,
            work,
            ..
        } = &*workload;

        let ops = stats.durations.count();
        let ops_ps = ops as f32 / duration.as_secs() as f32;
        println!(
            "Workload {index} (concurrency: {concurrency}, keys: {keys}, work: {work:?}): {ops} operations, {ops_ps:.2} ops/s"
        );
        if ops == 0 {
            println!();
            continue;
        }

        let avg = Duration::from_secs_f64(stats.durations.sum().unwrap_or_default() / ops as f64);
        let quantile = |q| {
            let secs = stats.durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let p50 = quantile(0.5);
        let p90 = quantile(0.9);
        let p99 = quantile(0.99);
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");

        let outcomes: Vec<_> = stats
            .outcomes
            .iter()
            .map(|(kind, count)| format!("{kind}: {count}"))
            .collect();
        println!("  outcomes: {}", outcomes.join("; "));
        println!();
    }

    let stats = loader.stats().await;
    println!(
        "Loader: {} ongoing, {} draining, {} cached",
        stats.ongoing_tasks, stats.draining_tasks, stats.cached_entries
    );

    loader.release_all(Some("stresstest finished".into())).await?;

    Ok(())
}

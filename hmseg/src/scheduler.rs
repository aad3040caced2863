//! Drains task graph on workers.
//!
//! Each round looks at every runnable task and computes how many copies it would
//! cost on the workers that may run it. Tasks whose buffers are spread over several
//! workers are conflicted, they are only picked when strictly cheaper than the best
//! unconflicted task, because resolving them flushes buffers off other workers.
//! Ties between equally cheap candidates are broken randomly with seeded rng,
//! so that no task waits forever behind equally cheap ones.

use crate::{
    buffers::{BufferId, HostBuffers},
    error::SegError,
    priority::BufferPriorities,
    runtime::DebugMask,
    task::{TaskGraph, TaskId},
    worker::{Worker, WorkerId},
};
use rand::{rngs::SmallRng, Rng};

/// Statistics of one worker after a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    /// Device index in the device context
    pub device: usize,
    /// Number of buffer slots of the worker
    pub capacity: usize,
    /// Most buffers resident at once, never above capacity
    pub max_resident: usize,
    /// Copies between host and this device
    pub memcpies: usize,
}

/// Statistics of one scheduled run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Number of task runs
    pub tasks_performed: usize,
    /// Copies between host and devices, over all workers
    pub memcpies: usize,
    pub workers: Vec<WorkerStats>,
    /// Tasks with runs left after the scheduler ran out of runnable tasks
    pub unfinished_tasks: usize,
    /// Tasks whose signals before first run differ from their initial activation
    pub activation_mismatches: usize,
}

// Best (task, worker) pairs found so far in one round
#[derive(Debug)]
struct Candidates {
    cost: usize,
    pairs: Vec<(TaskId, WorkerId)>,
}

impl Candidates {
    const fn new() -> Candidates {
        Candidates { cost: usize::MAX, pairs: Vec::new() }
    }

    fn offer(&mut self, cost: usize, task: TaskId, worker: WorkerId) {
        if cost < self.cost {
            self.cost = cost;
            self.pairs.clear();
        }
        if cost == self.cost {
            self.pairs.push((task, worker));
        }
    }

    fn pick(&self, rng: &mut SmallRng) -> Option<(TaskId, WorkerId)> {
        if self.pairs.is_empty() {
            None
        } else {
            Some(self.pairs[rng.gen_range(0..self.pairs.len())])
        }
    }
}

/// Runs every task of the graph to completion.
///
/// Workers must be indexed by their [`WorkerId`]. Every worker is flushed at the end,
/// so host buffers hold final results once this returns.
/// # Errors
/// Returns internal error if some tasks were never activated, or backend errors of workers.
#[allow(clippy::too_many_arguments)]
pub(crate) fn drain(
    tasks: &mut TaskGraph,
    workers: &mut [Worker<'_>],
    host: &mut HostBuffers,
    priorities: &BufferPriorities,
    rng: &mut SmallRng,
    report_rate: usize,
    debug: DebugMask,
) -> Result<RunStats, SegError> {
    if workers.is_empty() {
        return Err(SegError::NoDeviceAvailable);
    }
    debug_assert!(workers.iter().enumerate().all(|(i, w)| usize::from(w.id()) == i));
    let begin = std::time::Instant::now();
    let total_runs = tasks.total_runs();
    let mut performed = 0;

    while tasks.has_runnable() {
        let mut unconflicted = Candidates::new();
        let mut conflicted = Candidates::new();
        for id in tasks.runnable() {
            let task = &tasks[id];
            let mut holders: Vec<WorkerId> = task.buffers.iter().filter_map(|&b| host.holder(b)).collect();
            holders.sort_unstable();
            holders.dedup();
            match holders.len() {
                0 => {
                    for worker in workers.iter() {
                        unconflicted.offer(worker.calc_weight(task, host, priorities), id, worker.id());
                    }
                }
                1 => {
                    let worker = &workers[usize::from(holders[0])];
                    debug_assert!(worker.can_do(task, host));
                    unconflicted.offer(worker.calc_weight(task, host, priorities), id, worker.id());
                }
                _ => {
                    // Worker already holding most of the task keeps it, lowest id on ties
                    let mut chosen = holders[0];
                    let mut most = 0;
                    for &h in &holders {
                        let held = workers[usize::from(h)].held(task);
                        if held > most {
                            most = held;
                            chosen = h;
                        }
                    }
                    let worker = &workers[usize::from(chosen)];
                    debug_assert!(worker.conflicted(task, host));
                    let flushes = task
                        .buffers
                        .iter()
                        .filter(|&&b| host.holder(b).is_some_and(|h| h != chosen) && host.needs_copy_back(b))
                        .count();
                    let cost = worker.calc_weight(task, host, priorities) + flushes;
                    conflicted.offer(cost, id, chosen);
                }
            }
        }

        let pick = if conflicted.cost < unconflicted.cost {
            conflicted.pick(rng).map(|x| (x, true))
        } else {
            unconflicted.pick(rng).map(|x| (x, false))
        };
        let Some(((id, worker), contested)) = pick else {
            break;
        };
        if debug.sched() {
            println!(
                "Performing {:?} of {} on worker {worker:?}{}",
                tasks[id].kind,
                tasks[id].node,
                if contested { " after resolving conflict" } else { "" }
            );
        }
        if contested {
            unconflict(id, worker, tasks, workers, host)?;
        }

        // Copies back made by other workers must finish before we read those buffers
        let foreign: Vec<WorkerId> = tasks[id]
            .buffers
            .iter()
            .filter_map(|&b| host.last_writer(b))
            .filter(|&w| w != worker)
            .collect();
        for w in foreign {
            workers[usize::from(w)].sync()?;
        }
        workers[usize::from(worker)].perform(&tasks[id], host, priorities)?;
        tasks.complete(id);
        performed += 1;

        if report_rate > 0 && performed % report_rate == 0 && debug.sched() {
            for w in workers.iter_mut() {
                w.sync()?;
            }
            let memcpies: usize = workers.iter().map(Worker::num_memcpies).sum();
            println!("Finished {performed} tasks with {memcpies} memory transfers.");
        }
    }

    let unfinished = tasks.unfinished();
    if unfinished > 0 {
        debug_assert_eq!(unfinished, 0, "Tasks were never activated");
        return Err(SegError::internal(format!(
            "Scheduler ran out of runnable tasks with {unfinished} tasks unfinished after {performed} of {total_runs} runs"
        )));
    }
    for w in workers.iter_mut() {
        w.flush(host)?;
    }

    let activation_mismatches = tasks
        .ids()
        .filter(|&id| tasks[id].signals_before_first_run() != -tasks[id].initial_active())
        .count();
    let worker_stats: Vec<WorkerStats> = workers
        .iter()
        .map(|w| WorkerStats {
            device: w.device_id(),
            capacity: w.capacity(),
            max_resident: w.max_resident(),
            memcpies: w.num_memcpies(),
        })
        .collect();
    let memcpies = worker_stats.iter().map(|w| w.memcpies).sum();
    if debug.perf() {
        let elapsed = begin.elapsed().as_micros();
        println!("Performed {performed} tasks with {memcpies} memory transfers in {elapsed}us");
    }
    Ok(RunStats {
        tasks_performed: performed,
        memcpies,
        workers: worker_stats,
        unfinished_tasks: unfinished,
        activation_mismatches,
    })
}

// Moves every buffer of task held by a worker other than `worker` back to host
fn unconflict(
    id: TaskId,
    worker: WorkerId,
    tasks: &TaskGraph,
    workers: &mut [Worker<'_>],
    host: &mut HostBuffers,
) -> Result<(), SegError> {
    let contested: Vec<(BufferId, WorkerId)> = tasks[id]
        .buffers
        .iter()
        .filter_map(|&b| host.holder(b).map(|h| (b, h)))
        .filter(|&(_, h)| h != worker)
        .collect();
    for (buffer, holder) in contested {
        workers[usize::from(holder)].evict_buffer(buffer, host)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::Candidates;
    use crate::{task::TaskId, worker::WorkerId};
    use rand::{rngs::SmallRng, SeedableRng};

    #[test]
    fn candidates_keep_only_cheapest() {
        let mut candidates = Candidates::new();
        candidates.offer(3, TaskId::from(0), WorkerId::from(0));
        candidates.offer(1, TaskId::from(1), WorkerId::from(0));
        candidates.offer(1, TaskId::from(2), WorkerId::from(1));
        candidates.offer(2, TaskId::from(3), WorkerId::from(1));
        assert_eq!(candidates.cost, 1);
        assert_eq!(candidates.pairs.len(), 2);
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..10 {
            let (task, _) = candidates.pick(&mut rng).unwrap();
            assert!(task == TaskId::from(1) || task == TaskId::from(2));
        }
        assert!(Candidates::new().pick(&mut rng).is_none());
    }
}

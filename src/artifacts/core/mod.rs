//! Bounded worker pool for I/O-bound bulk operations
//!
//! Hashing many files, materializing many links and batch existence checks
//! are all embarrassingly parallel and blocked on the filesystem, not the
//! CPU. A fixed number of worker threads pulls jobs from a channel; results
//! are collected without any ordering guarantee between independent items.

use crossbeam_channel::bounded;

/// Default parallelism for bulk I/O operations (the `jobs` knob).
pub fn default_jobs() -> usize {
    num_cpus::get()
}

/// Run `f` over every item on at most `jobs` worker threads.
///
/// Results are returned in completion order, not submission order. Workers
/// drain the queue cooperatively; a panicking job propagates out of the
/// scope, so callers should return errors as values instead of panicking.
pub fn run_jobs<T, R, F>(items: Vec<T>, jobs: usize, f: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let jobs = jobs.max(1);
    let expected = items.len();
    let (task_tx, task_rx) = bounded::<T>(jobs);
    let (result_tx, result_rx) = bounded::<R>(jobs);

    std::thread::scope(|scope| {
        for _ in 0..jobs {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let f = &f;
            scope.spawn(move || {
                for item in task_rx.iter() {
                    if result_tx.send(f(item)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(task_rx);
        drop(result_tx);

        scope.spawn(move || {
            for item in items {
                if task_tx.send(item).is_err() {
                    break;
                }
            }
        });

        result_rx.iter().take(expected).collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn runs_every_item_exactly_once() {
        let items: Vec<u64> = (0..100).collect();
        let mut results = run_jobs(items, 4, |n| n * 2);
        results.sort_unstable();

        let expected: Vec<u64> = (0..100).map(|n| n * 2).collect();
        assert_eq!(results, expected);
    }

    #[test]
    fn zero_jobs_is_clamped_to_one() {
        let results = run_jobs(vec![1, 2, 3], 0, |n| n + 1);
        assert_eq!(results.len(), 3);
    }
}

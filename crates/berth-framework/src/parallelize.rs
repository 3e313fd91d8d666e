//! Bounded fan-out for per-node work.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Upper bound on worker threads for Filter/Score fan-out.
pub const DEFAULT_PARALLELISM: usize = 16;

/// Run `work(i)` for every `i in 0..pieces` on up to
/// `min(parallelism, pieces)` scoped worker threads.
///
/// Work items are claimed through an atomic cursor, so uneven item costs
/// balance themselves. Returns once every piece ran.
pub fn parallelize<F>(pieces: usize, parallelism: usize, work: F)
where
    F: Fn(usize) + Send + Sync,
{
    if pieces == 0 {
        return;
    }
    let workers = parallelism.clamp(1, pieces);
    if workers == 1 {
        for index in 0..pieces {
            work(index);
        }
        return;
    }

    let cursor = AtomicUsize::new(0);
    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let index = cursor.fetch_add(1, Ordering::Relaxed);
                if index >= pieces {
                    break;
                }
                work(index);
            });
        }
    });
}

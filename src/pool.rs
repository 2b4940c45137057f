//! Fixed-size worker pool over a closed queue of indices.
//!
//! Workers claim indices from a shared cursor and hand finished values to the
//! calling thread over a channel; only the caller writes result slots, so
//! completion order never leaks into result order.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

/// Run `job` once for every index in `0..total` on at most `jobs` threads.
///
/// `on_complete` runs on the calling thread, once per finished index, in
/// completion order. The returned values are in index order.
pub fn run_indexed<T, F, P>(total: usize, jobs: usize, job: F, mut on_complete: P) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync,
    P: FnMut(usize, &T),
{
    if total == 0 {
        return Vec::new();
    }
    let workers = jobs.clamp(1, total);
    let cursor = AtomicUsize::new(0);
    let mut slots: Vec<Option<T>> = std::iter::repeat_with(|| None).take(total).collect();
    let (tx, rx) = mpsc::channel::<(usize, T)>();

    thread::scope(|scope| {
        for _ in 0..workers {
            let tx = tx.clone();
            let cursor = &cursor;
            let job = &job;
            scope.spawn(move || loop {
                let index = cursor.fetch_add(1, Ordering::Relaxed);
                if index >= total {
                    break;
                }
                let value = job(index);
                if tx.send((index, value)).is_err() {
                    break;
                }
            });
        }
        drop(tx);
        for (index, value) in rx {
            on_complete(index, &value);
            slots[index] = Some(value);
        }
    });

    slots.into_iter().flatten().collect()
}

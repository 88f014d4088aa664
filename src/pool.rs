//! Pull-based bounded worker pool, shared by the page and file levels.
//!
//! `min(limit, items)` cooperative workers repeatedly claim the next index
//! from one atomic cursor until it runs past the end. A slow item therefore
//! only occupies its own worker while the others keep pulling, which matters
//! when per-item latency is uneven (dense vs. sparse pages, large vs. small
//! scans).
//!
//! Each worker owns the results it produced; they are merged back into index
//! order after every worker has finished, so no lock is held across a
//! suspension point. A failing item is just a result: handlers return data,
//! and one item never cancels its siblings.

use futures::future::join_all;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Run `handler` once for every item with at most `limit` in flight.
///
/// Returns results in item order regardless of completion order.
pub async fn run_pool<'a, T, R, F, Fut>(items: &'a [T], limit: usize, handler: F) -> Vec<R>
where
    F: Fn(usize, &'a T) -> Fut,
    Fut: Future<Output = R>,
{
    let total = items.len();
    let workers = limit.max(1).min(total);
    if workers == 0 {
        return Vec::new();
    }

    let cursor = AtomicUsize::new(0);
    let cursor = &cursor;
    let handler = &handler;

    let lanes = (0..workers).map(|_| async move {
        let mut done = Vec::new();
        loop {
            let idx = cursor.fetch_add(1, Ordering::Relaxed);
            if idx >= total {
                break;
            }
            done.push((idx, handler(idx, &items[idx]).await));
        }
        done
    });

    let mut slots: Vec<Option<R>> = (0..total).map(|_| None).collect();
    for lane in join_all(lanes).await {
        for (idx, result) in lane {
            slots[idx] = Some(result);
        }
    }
    slots.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn results_come_back_in_item_order() {
        let latencies: Vec<u64> = (0..20)
            .map(|_| rand::thread_rng().gen_range(0..15))
            .collect();
        let out = run_pool(&latencies, 4, |idx, ms| async move {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
            idx * 10
        })
        .await;
        assert_eq!(out, (0..20).map(|i| i * 10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn never_exceeds_limit() {
        let (in_flight, peak) = (AtomicUsize::new(0), AtomicUsize::new(0));
        let (in_flight, peak) = (&in_flight, &peak);
        let items: Vec<u32> = (0..12).collect();
        run_pool(&items, 3, move |_, _| async move {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
        })
        .await;
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn workers_capped_by_item_count() {
        let (in_flight, peak) = (AtomicUsize::new(0), AtomicUsize::new(0));
        let (in_flight, peak) = (&in_flight, &peak);
        let items = [1, 2];
        run_pool(&items, 16, move |_, _| async move {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
        })
        .await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn every_item_handled_exactly_once() {
        let seen = Mutex::new(Vec::new());
        let items: Vec<usize> = (0..50).collect();
        run_pool(&items, 7, |idx, _| {
            seen.lock().unwrap().push(idx);
            async {}
        })
        .await;
        let mut seen = seen.into_inner().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, items);
    }

    #[tokio::test]
    async fn slow_item_does_not_starve_other_workers() {
        let finished = Mutex::new(Vec::new());
        // Item 0 is slow; the other worker should drain the remaining items.
        let latencies = [60u64, 1, 1, 1, 1, 1];
        let log = &finished;
        run_pool(&latencies, 2, move |idx, ms| async move {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
            log.lock().unwrap().push(idx);
        })
        .await;
        let finished = finished.into_inner().unwrap();
        assert_eq!(finished.last(), Some(&0));
        assert_eq!(finished.len(), 6);
    }

    #[tokio::test]
    async fn empty_input_yields_empty_output() {
        let items: Vec<u8> = Vec::new();
        let out: Vec<u8> = run_pool(&items, 4, |_, b| async move { *b }).await;
        assert!(out.is_empty());
    }
}

/*
 * This file is part of module-reconciler, licensed under the MIT License (MIT).
 *
 * Copyright (c) 2024 easybill GmbH
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to deal
 * in the Software without restriction, including without limitation the rights
 * to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
 * copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in all
 * copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
 * SOFTWARE.
 */
use std::collections::HashMap;
use std::sync::Arc;

use log::warn;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::WorkQueue;
use crate::controlplane::{ChangeEvent, ControlPlaneStore};
use crate::reconciler::{Reconcile, ReconcileOutcome};

/// Consumes the control plane's change feed and feeds the work queue, dropping
/// `Updated` deliveries whose `resource_version` is unchanged from the last one
/// seen for the same key (periodic resync no-ops, SPEC_FULL.md §4.5).
pub(crate) fn subscribe_to_control_plane(store: Arc<dyn ControlPlaneStore>, queue: Arc<WorkQueue>, cancellation: CancellationToken) {
    let mut changes = store.subscribe();
    tokio::spawn(async move {
        let last_seen: Mutex<HashMap<String, u64>> = Mutex::new(HashMap::new());
        loop {
            let event = tokio::select! {
                event = changes.recv() => event,
                _ = cancellation.cancelled() => return,
            };
            let Some(event) = event else { return };

            let release = event.release();
            let key = release.key();

            if let ChangeEvent::Updated(_) = &event {
                let mut seen = last_seen.lock().await;
                if seen.get(&key) == Some(&release.resource_version) {
                    continue;
                }
                seen.insert(key.clone(), release.resource_version);
            } else {
                last_seen.lock().await.insert(key.clone(), release.resource_version);
            }

            queue.add(key).await;
        }
    });
}

/// Spawns `worker_count` tasks draining `queue`, each invoking `reconciler` for
/// every dequeued key and dispatching on the returned [`ReconcileOutcome`]. A
/// hard `Err` from the reconciler is treated like `Requeue`: logged, then
/// re-added with rate-limited back-off.
pub(crate) fn run_workers(
    worker_count: usize,
    queue: Arc<WorkQueue>,
    reconciler: Arc<dyn Reconcile>,
    cancellation: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..worker_count.max(1))
        .map(|worker_id| {
            let queue = Arc::clone(&queue);
            let reconciler = Arc::clone(&reconciler);
            let cancellation = cancellation.clone();
            tokio::spawn(async move { worker_loop(worker_id, queue, reconciler, cancellation).await })
        })
        .collect()
}

async fn worker_loop(worker_id: usize, queue: Arc<WorkQueue>, reconciler: Arc<dyn Reconcile>, cancellation: CancellationToken) {
    loop {
        let item = tokio::select! {
            item = queue.get() => item,
            _ = cancellation.cancelled() => return,
        };
        let Some(key) = item else { return };

        match reconciler.reconcile(&key).await {
            Ok(ReconcileOutcome::Success) => {
                queue.forget(&key).await;
            }
            Ok(ReconcileOutcome::RequeueAfter(delay)) => {
                queue.forget(&key).await;
                queue.add_after(key.clone(), delay);
            }
            Ok(ReconcileOutcome::Requeue) => {
                queue.add_rate_limited(key.clone()).await;
            }
            Err(err) => {
                warn!("worker {worker_id}: reconcile of {key} failed: {err:?}");
                queue.add_rate_limited(key.clone()).await;
            }
        }
        queue.done(&key).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::queue::QueueConfig;

    struct CountingReconciler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Reconcile for CountingReconciler {
        async fn reconcile(&self, _release_key: &str) -> anyhow::Result<ReconcileOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ReconcileOutcome::Success)
        }
    }

    #[tokio::test]
    async fn worker_drains_queue_and_forgets_on_success() {
        let queue = Arc::new(WorkQueue::new(QueueConfig::default()));
        queue.add("S1/mod-a@1.0.0".to_string()).await;

        let reconciler = Arc::new(CountingReconciler { calls: AtomicUsize::new(0) });
        let cancellation = CancellationToken::new();
        let handles = run_workers(1, Arc::clone(&queue), reconciler.clone(), cancellation.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 1);

        cancellation.cancel();
        queue.shutdown().await;
        for handle in handles {
            handle.await.unwrap();
        }
    }
}

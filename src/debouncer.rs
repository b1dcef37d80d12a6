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
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::host_signal::HostSignal;

/// The width of the coalescing window: multiple `emit_restart` calls inside this
/// window collapse into a single host restart signal.
const DEBOUNCE_WINDOW: Duration = Duration::from_secs(5);

struct DebouncerState {
    deadline: Instant,
    restart_reason: Option<String>,
}

/// Coalesces many "modules changed" signals into a single host restart signal.
/// `emit_restart` and the background loop share one mutex; the loop holds it across
/// the (non-blocking, `tokio::time::sleep_until`-based) wait, releasing only when a
/// tick or cancellation is observed, so emitters are intentionally serialized behind
/// the loop. Throughput is not a concern here; correctness of the coalescing is.
#[derive(Clone)]
pub(crate) struct RestartDebouncer {
    state: Arc<Mutex<DebouncerState>>,
    host_signal: Arc<dyn HostSignal>,
}

impl RestartDebouncer {
    pub(crate) fn new(host_signal: Arc<dyn HostSignal>) -> Self {
        Self {
            state: Arc::new(Mutex::new(DebouncerState {
                deadline: Instant::now() + DEBOUNCE_WINDOW,
                restart_reason: None,
            })),
            host_signal,
        }
    }

    /// Records `reason` and resets the coalescing window.
    pub(crate) async fn emit_restart(&self, reason: impl Into<String>) {
        let mut state = self.state.lock().await;
        state.restart_reason = Some(reason.into());
        state.deadline = Instant::now() + DEBOUNCE_WINDOW;
    }

    /// Runs the coalescing loop until `cancellation` fires. Intended to be spawned
    /// as a single background task for the lifetime of the process.
    ///
    /// A naive "capture deadline, drop the lock, sleep, relock" loop would miss
    /// resets that land while it sleeps: `emit_restart` could push `deadline`
    /// further out, but the sleep already in flight was armed against the stale
    /// value and fires anyway. So each wake re-reads the live deadline under the
    /// lock and keeps sleeping for the remainder whenever it moved.
    pub(crate) async fn run(&self, cancellation: CancellationToken) {
        loop {
            let mut state = self.state.lock().await;
            loop {
                let deadline = state.deadline;
                drop(state);

                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = cancellation.cancelled() => {
                        info!("restart debouncer shutting down");
                        return;
                    }
                }

                state = self.state.lock().await;
                if state.deadline <= deadline {
                    break;
                }
                // a later emit_restart reset the window while we were sleeping; wait out the rest of it.
            }

            if let Some(reason) = state.restart_reason.take() {
                if let Err(err) = self.host_signal.send() {
                    error!("failed to signal host restart for reason '{reason}': {err}");
                    std::process::exit(1);
                }
                info!("emitted host restart signal, reason: {reason}");
            }
            state.deadline = Instant::now() + DEBOUNCE_WINDOW;
            drop(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSignal(Arc<AtomicUsize>);

    impl HostSignal for CountingSignal {
        fn send(&self) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn coalesces_multiple_emits_within_window() {
        let counter = Arc::new(AtomicUsize::new(0));
        let debouncer = RestartDebouncer::new(Arc::new(CountingSignal(counter.clone())));
        let cancellation = CancellationToken::new();

        let loop_handle = tokio::spawn({
            let debouncer = debouncer.clone();
            let cancellation = cancellation.clone();
            async move { debouncer.run(cancellation).await }
        });

        debouncer.emit_restart("first").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        debouncer.emit_restart("second").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        debouncer.emit_restart("third").await;

        tokio::time::sleep(DEBOUNCE_WINDOW + Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        debouncer.emit_restart("fourth").await;
        tokio::time::sleep(DEBOUNCE_WINDOW + Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        cancellation.cancel();
        loop_handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_emits_keep_resetting_the_live_deadline_while_the_loop_sleeps() {
        let counter = Arc::new(AtomicUsize::new(0));
        let debouncer = RestartDebouncer::new(Arc::new(CountingSignal(counter.clone())));
        let cancellation = CancellationToken::new();

        let loop_handle = tokio::spawn({
            let debouncer = debouncer.clone();
            let cancellation = cancellation.clone();
            async move { debouncer.run(cancellation).await }
        });

        // An emit every 1s, well inside the 5s window, for much longer than the
        // window itself: a true debounce must never fire while this keeps up,
        // even though the loop's in-flight sleep was armed against an earlier,
        // now-stale deadline on every iteration.
        for reason in 0..8 {
            debouncer.emit_restart(format!("sustained-{reason}")).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0, "continuous resets must suppress firing entirely");

        // once the emits stop, the window finally elapses and exactly one signal fires.
        tokio::time::sleep(DEBOUNCE_WINDOW + Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        cancellation.cancel();
        loop_handle.await.unwrap();
    }
}

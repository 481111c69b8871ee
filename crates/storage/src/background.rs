use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::store::StoreInner;

impl StoreInner {
    /// Start the background writer: a daemon thread that wakes at a tenth
    /// of the auto-commit delay and either commits pending changes (once
    /// the full delay has elapsed) or, when idle, runs one compaction
    /// slice if the aggregate chunk fill rate has dropped below the
    /// configured threshold.
    pub(crate) fn start_background_writer(this: &Arc<StoreInner>) {
        if this.background_alive.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(this);
        let alive = this.background_alive.clone();
        let signal = this.background_signal.clone();
        let delay = Duration::from_millis(this.cfg.auto_commit_delay_ms);
        let nap = Duration::from_millis((this.cfg.auto_commit_delay_ms / 10).max(1));
        let compact_threshold = this.cfg.auto_compact_fill_rate;

        let handle = std::thread::Builder::new()
            .name("kurodb-background".to_string())
            .spawn(move || {
                let mut last_commit = Instant::now();
                loop {
                    {
                        let (lock, condvar) = &*signal;
                        let mut stop = lock.lock();
                        if *stop {
                            break;
                        }
                        condvar.wait_for(&mut stop, nap);
                        if *stop {
                            break;
                        }
                    }
                    if !alive.load(Ordering::Acquire) {
                        break;
                    }
                    let Some(store) = weak.upgrade() else {
                        break;
                    };
                    if !store.is_open() {
                        break;
                    }

                    if store.has_changes() {
                        if last_commit.elapsed() >= delay {
                            trace!("background commit");
                            let _ = store.commit();
                            last_commit = Instant::now();
                        }
                    } else if compact_threshold > 0 {
                        let fill = store.aggregate_fill_rate();
                        if fill < compact_threshold {
                            debug!(fill, "background compaction slice");
                            // A modest per-slice budget keeps the pause
                            // bounded; rewritten pages ride the next
                            // commit.
                            let _ = store.compact_rewrite(compact_threshold, 2 * 1024 * 1024);
                        }
                    }
                }
            })
            .expect("spawn background writer");
        *this.background.lock() = Some(handle);
    }

    /// Cooperative shutdown: clear the lifecycle slot, wake the thread,
    /// and optionally join it.
    pub(crate) fn stop_background_writer(&self, wait: bool) {
        self.background_alive.store(false, Ordering::Release);
        {
            let (lock, condvar) = &*self.background_signal;
            *lock.lock() = true;
            condvar.notify_all();
        }
        if wait {
            if let Some(handle) = self.background.lock().take() {
                let _ = handle.join();
            }
        }
    }

    /// Live bytes over total bytes across all chunks, in percent.
    pub(crate) fn aggregate_fill_rate(&self) -> u8 {
        let chunks = self.chunks.lock();
        let (mut live, mut total) = (0u64, 0u64);
        for chunk in chunks.values() {
            live += chunk.max_len_live;
            total += chunk.max_len;
        }
        if total == 0 {
            100
        } else {
            (100 * live / total) as u8
        }
    }
}

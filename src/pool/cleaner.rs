//! Background eviction of idle connections by idle time and lifetime.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::{close_in_background, BackendConnection, Dialer, PoolInner, PoolState};

/// The cleaner never wakes more often than this.
const MIN_CLEAN_INTERVAL: Duration = Duration::from_secs(1);

impl<D: Dialer> PoolInner<D> {
    /// Start the cleaner if eviction is configured, connections are open and
    /// no cleaner is running yet.
    pub(super) fn start_cleaner_locked(self: &Arc<Self>, state: &mut PoolState<D::Stream>) {
        let Some(interval) = self.config.shortest_eviction() else {
            return;
        };
        if state.num_open == 0 || state.cleaner.is_some() {
            return;
        }

        let (tx, rx) = mpsc::channel(1);
        state.cleaner = Some(tx);
        tokio::spawn(run_cleaner(Arc::downgrade(self), rx, interval));
    }

    /// One cleaning pass. Removes stale idle connections from the list and
    /// returns them together with the delay until the next one could expire.
    fn clean_locked(
        &self,
        state: &mut PoolState<D::Stream>,
        mut next: Duration,
    ) -> (Duration, Vec<BackendConnection<D::Stream>>) {
        let now = Instant::now();
        let mut closing = Vec::new();

        if let Some(max_idle_time) = self.config.idle_time() {
            // The idle list is ordered by return time, so everything up to the
            // newest stale entry is stale.
            let stale = state
                .free
                .iter()
                .rposition(|c| now.saturating_duration_since(c.returned_at) > max_idle_time);
            if let Some(last) = stale {
                closing.extend(state.free.drain(..=last));
                state.max_idle_time_closed += closing.len() as u64;
            }

            if let Some(oldest) = state.free.first() {
                let idle_for = now.saturating_duration_since(oldest.returned_at);
                next = next.min(max_idle_time.saturating_sub(idle_for));
            }
        }

        if let Some(max_lifetime) = self.config.lifetime() {
            let before = closing.len();
            let mut kept = Vec::with_capacity(state.free.len());
            for conn in state.free.drain(..) {
                let age = now.saturating_duration_since(conn.created_at());
                if age >= max_lifetime {
                    closing.push(conn);
                } else {
                    next = next.min(max_lifetime - age);
                    kept.push(conn);
                }
            }
            state.free = kept;
            state.max_lifetime_closed += (closing.len() - before) as u64;
        }

        if !closing.is_empty() {
            state.num_open -= closing.len();
            self.maybe_open_new_connections(state);
        }

        (next, closing)
    }
}

async fn run_cleaner<D: Dialer>(
    pool: Weak<PoolInner<D>>,
    mut wake: mpsc::Receiver<()>,
    mut interval: Duration,
) {
    loop {
        interval = interval.max(MIN_CLEAN_INTERVAL);

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            // Also fires when the pool drops the sender on close.
            _ = wake.recv() => {}
        }

        let Some(pool) = pool.upgrade() else { return };

        let closing = {
            let mut state = pool.state.lock();
            let Some(shortest) = pool.config.shortest_eviction() else {
                state.cleaner = None;
                return;
            };
            if state.closed || state.num_open == 0 {
                state.cleaner = None;
                return;
            }

            let (next, closing) = pool.clean_locked(&mut state, shortest);
            interval = next;
            closing
        };

        if !closing.is_empty() {
            debug!(
                closed = closing.len(),
                next = ?interval,
                "evicted idle connections"
            );
            close_in_background(closing);
        }
    }
}

//! Live progress fan-out to any number of subscribers.
//!
//! The scheduler publishes the running `scan_progress` rows at every tick;
//! the hub forwards them with at-least-once delivery, de-duplicated by a
//! monotonic `(job, items_found)` check. Every subscriber gets its own
//! bounded buffer: a slow consumer loses frames instead of blocking workers,
//! and sees a [`ProgressFrame::Lagged`] marker before it catches up.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::trace;
use serde::{Deserialize, Serialize};

use crate::catalog::{ScanProgress, ScanStatus};

/// One frame of the progress stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "lowercase")]
pub enum ProgressFrame {
    /// A running scan advanced
    Progress(ScanProgress),
    /// A scan reached a terminal state
    Ended {
        /// The job that terminated
        job_id: i64,
        /// Terminal status
        status: ScanStatus,
    },
    /// This subscriber was too slow and missed frames
    Lagged,
}

struct Slot {
    tx: Sender<ProgressFrame>,
    lagged: bool,
}

struct HubInner {
    subs: Vec<Slot>,
    /// Highest published `items_found` per job
    last_items: HashMap<i64, u64>,
}

/// Publish/subscribe fan-out for [`ProgressFrame`]s.
#[derive(Debug)]
pub struct ProgressHub {
    inner: Mutex<HubInner>,
    buffer: usize,
}

impl std::fmt::Debug for HubInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubInner")
            .field("subs", &self.subs.len())
            .finish_non_exhaustive()
    }
}

impl ProgressHub {
    /// Create a hub whose subscribers buffer up to `buffer` frames.
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Mutex::new(HubInner {
                subs: Vec::new(),
                last_items: HashMap::new(),
            }),
            buffer: buffer.max(1),
        }
    }

    /// Attach a new subscriber.
    ///
    /// Unsubscribing is dropping the handle; jobs are unaffected.
    pub fn subscribe(&self) -> ProgressSubscriber {
        let (tx, rx) = bounded(self.buffer);
        self.inner.lock().unwrap().subs.push(Slot { tx, lagged: false });
        ProgressSubscriber { rx }
    }

    /// Number of currently attached subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subs.len()
    }

    /// Publish the current running rows.
    ///
    /// Rows whose `items_found` has not advanced since the last publication
    /// are dropped here, which gives subscribers strictly increasing counters
    /// per job.
    pub fn publish_progress(&self, rows: &[ScanProgress]) {
        let mut inner = self.inner.lock().unwrap();
        for row in rows {
            let advanced = inner
                .last_items
                .get(&row.id)
                .map_or(true, |last| row.items_found > *last);
            if !advanced {
                continue;
            }
            _ = inner.last_items.insert(row.id, row.items_found);
            trace!("progress frame: job {} at {} items", row.id, row.items_found);
            Self::fan_out(&mut inner.subs, &ProgressFrame::Progress(row.clone()));
        }
    }

    /// Publish a terminal frame for a job. Terminal frames are never deduplicated.
    pub fn publish_ended(&self, job_id: i64, status: ScanStatus) {
        let mut inner = self.inner.lock().unwrap();
        _ = inner.last_items.remove(&job_id);
        Self::fan_out(&mut inner.subs, &ProgressFrame::Ended { job_id, status });
    }

    fn fan_out(subs: &mut Vec<Slot>, frame: &ProgressFrame) {
        subs.retain_mut(|slot| {
            if slot.lagged {
                // the subscriber must learn it missed frames before new data
                match slot.tx.try_send(ProgressFrame::Lagged) {
                    Ok(()) => slot.lagged = false,
                    Err(TrySendError::Full(_)) => return true,
                    Err(TrySendError::Disconnected(_)) => return false,
                }
            }
            match slot.tx.try_send(frame.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    slot.lagged = true;
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
    }
}

/// A handle on the progress stream.
#[derive(Debug)]
pub struct ProgressSubscriber {
    rx: Receiver<ProgressFrame>,
}

impl ProgressSubscriber {
    /// Wait for the next frame; `None` once the hub is gone.
    #[must_use]
    pub fn recv(&self) -> Option<ProgressFrame> {
        self.rx.recv().ok()
    }

    /// Wait up to `timeout` for the next frame.
    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ProgressFrame> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Take whatever is buffered right now.
    #[must_use]
    pub fn drain(&self) -> Vec<ProgressFrame> {
        self.rx.try_iter().collect()
    }
}

impl Iterator for ProgressSubscriber {
    type Item = ProgressFrame;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    use crate::uri::Uri;

    use super::*;

    fn row(id: i64, items: u64) -> ScanProgress {
        ScanProgress {
            id,
            root_uri: Uri::parse("/a").unwrap(),
            worker_pid: 1,
            started_at: Utc.timestamp_opt(0, 0).unwrap(),
            items_found: items,
            items_per_sec: None,
            error_count: 0,
            status: ScanStatus::Running,
        }
    }

    fn items_of(frames: &[ProgressFrame]) -> Vec<u64> {
        frames
            .iter()
            .filter_map(|f| match f {
                ProgressFrame::Progress(p) => Some(p.items_found),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_two_subscribers_see_strictly_increasing_items() {
        let hub = ProgressHub::new(16);
        let sub_a = hub.subscribe();
        let sub_b = hub.subscribe();

        for items in [10, 20, 20, 15, 30] {
            hub.publish_progress(&[row(1, items)]);
        }

        for sub in [&sub_a, &sub_b] {
            let got = items_of(&sub.drain());
            assert_eq!(got, [10, 20, 30]);
            assert!(got.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_jobs_are_deduplicated_independently() {
        let hub = ProgressHub::new(16);
        let sub = hub.subscribe();

        hub.publish_progress(&[row(1, 10), row(2, 10)]);
        hub.publish_progress(&[row(1, 10), row(2, 20)]);

        assert_eq!(items_of(&sub.drain()), [10, 10, 20]);
    }

    #[test]
    fn test_slow_subscriber_gets_lagged_marker_and_catches_up() {
        let hub = ProgressHub::new(2);
        let sub = hub.subscribe();

        // fill the buffer and then some
        for items in [1, 2, 3, 4] {
            hub.publish_progress(&[row(1, items)]);
        }
        assert_eq!(items_of(&sub.drain()), [1, 2]);

        // the next tick first delivers the lag marker, then fresh data
        hub.publish_progress(&[row(1, 5)]);
        let frames = sub.drain();
        assert_eq!(frames[0], ProgressFrame::Lagged);
        assert_eq!(items_of(&frames), [5]);
    }

    #[test]
    fn test_terminal_frames_always_delivered() {
        let hub = ProgressHub::new(16);
        let sub = hub.subscribe();

        hub.publish_progress(&[row(7, 10)]);
        hub.publish_ended(7, ScanStatus::Completed);

        let frames = sub.drain();
        assert_eq!(
            frames.last().unwrap(),
            &ProgressFrame::Ended {
                job_id: 7,
                status: ScanStatus::Completed
            }
        );

        // a later job may reuse lower counters after the terminal frame
        hub.publish_progress(&[row(7, 1)]);
        assert_eq!(items_of(&sub.drain()), [1]);
    }

    #[test]
    fn test_dropped_subscribers_are_removed() {
        let hub = ProgressHub::new(2);
        let sub = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);

        drop(sub);
        hub.publish_progress(&[row(1, 1)]);
        assert_eq!(hub.subscriber_count(), 0);
    }
}

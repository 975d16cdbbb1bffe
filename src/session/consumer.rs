//! Per-subscriber message sink
//!
//! A consumer owns its jitter state and bounded queue; the source's fan-out
//! enqueues into it, the play loop drains it in batches. The merged-write
//! handshake: the play loop parks on [`Consumer::wait`] with thresholds, the
//! enqueue side signals once enough messages (or enough buffered duration)
//! piled up, and one syscall then flushes the whole batch.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use crate::protocol::message::RtmpMessage;
use crate::session::jitter::{JitterAlgorithm, TimeJitter};
use crate::session::queue::MessageQueue;
use crate::session::source::Source;

/// A play session's message sink, attached to one source
pub struct Consumer {
    /// Back-reference used only to detach on drop
    source: Weak<Source>,
    paused: AtomicBool,
    jitter: Mutex<TimeJitter>,
    queue: Mutex<MessageQueue>,
    /// Armed when the source's publisher changed; reported at next dump
    should_update_source_id: AtomicBool,
    /// Merged-write condition variable
    mw_wait: Notify,
    mw_waiting: AtomicBool,
    mw_min_msgs: AtomicUsize,
    mw_duration_ms: AtomicI64,
}

impl Consumer {
    pub(crate) fn new(source: Weak<Source>, queue_size_secs: f64) -> Self {
        let mut queue = MessageQueue::new();
        queue.set_queue_size(queue_size_secs);

        Self {
            source,
            paused: AtomicBool::new(false),
            jitter: Mutex::new(TimeJitter::new()),
            queue: Mutex::new(queue),
            should_update_source_id: AtomicBool::new(false),
            mw_wait: Notify::new(),
            mw_waiting: AtomicBool::new(false),
            mw_min_msgs: AtomicUsize::new(0),
            mw_duration_ms: AtomicI64::new(0),
        }
    }

    /// Re-cap the queue duration
    pub fn set_queue_size(&self, seconds: f64) {
        self.queue.lock().expect("queue lock").set_queue_size(seconds);
    }

    /// Corrected playback time, for progress reporting
    pub fn time(&self) -> i64 {
        self.jitter.lock().expect("jitter lock").time()
    }

    /// Arm the source-id-changed notice (new publisher took over)
    pub fn update_source_id(&self) {
        self.should_update_source_id.store(true, Ordering::Relaxed);
    }

    /// Accept one message from the source's fan-out.
    ///
    /// Unless ATC is on, jitter correction rewrites this consumer's copy of
    /// the header. A parked play loop is woken once either merged-write
    /// threshold holds.
    pub fn enqueue(&self, mut msg: RtmpMessage, atc: bool, algorithm: JitterAlgorithm) {
        if !atc {
            self.jitter.lock().expect("jitter lock").correct(&mut msg, algorithm);
        }

        let (size, duration) = {
            let mut queue = self.queue.lock().expect("queue lock");
            queue.enqueue(msg);
            (queue.size(), queue.duration())
        };

        if self.mw_waiting.load(Ordering::Acquire) {
            let min_msgs = self.mw_min_msgs.load(Ordering::Relaxed);
            let min_duration = self.mw_duration_ms.load(Ordering::Relaxed);
            if size >= min_msgs || (min_duration > 0 && duration >= min_duration) {
                self.mw_waiting.store(false, Ordering::Release);
                self.mw_wait.notify_one();
            }
        }
    }

    /// Drain up to `max_count` queued messages; nothing while paused.
    pub fn dump_packets(&self, max_count: usize) -> Vec<RtmpMessage> {
        if self.paused.load(Ordering::Relaxed) {
            return Vec::new();
        }

        if self.should_update_source_id.swap(false, Ordering::Relaxed) {
            debug!("play stream source id changed");
        }

        self.queue.lock().expect("queue lock").dump_packets(max_count)
    }

    /// Park until `nb_msgs` messages or `duration`'s worth of content are
    /// queued, or the timeout passes. Returns immediately when a threshold
    /// already holds.
    pub async fn wait(&self, nb_msgs: usize, duration: Duration) {
        {
            let queue = self.queue.lock().expect("queue lock");
            if queue.size() >= nb_msgs || queue.duration() >= duration.as_millis() as i64 {
                return;
            }
        }

        self.mw_min_msgs.store(nb_msgs, Ordering::Relaxed);
        self.mw_duration_ms.store(duration.as_millis() as i64, Ordering::Relaxed);
        self.mw_waiting.store(true, Ordering::Release);

        let _ = tokio::time::timeout(duration, self.mw_wait.notified()).await;
        self.mw_waiting.store(false, Ordering::Release);
    }

    /// Force-release a parked waiter (dispose, pause)
    pub fn wake_up(&self) {
        self.mw_waiting.store(false, Ordering::Release);
        self.mw_wait.notify_one();
    }

    /// Flip the pause flag and release any waiter
    pub fn on_play_client_pause(&self, is_pause: bool) {
        debug!(is_pause, "play client pause");
        self.paused.store(is_pause, Ordering::Relaxed);
        self.wake_up();
    }

    /// Queue length in messages, for tests and stats
    pub fn queue_len(&self) -> usize {
        self.queue.lock().expect("queue lock").size()
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Some(source) = self.source.upgrade() {
            source.on_consumer_destroy(self);
        }
    }
}

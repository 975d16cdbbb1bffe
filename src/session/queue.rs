//! Per-consumer message queue and the publisher-side mix queue
//!
//! [`MessageQueue`] is bounded by the wall-clock duration of buffered AV
//! content rather than by message count: a slow player drops its oldest
//! frames back to a video key frame, so what remains stays decodable.
//!
//! [`MixQueue`] reorders an interleaving-challenged publisher's audio and
//! video by timestamp before the source fans them out.

use std::collections::{BTreeMap, VecDeque};

use tracing::debug;

use crate::media::flv;
use crate::protocol::message::RtmpMessage;

/// Ordered message sequence bounded by buffered AV duration
#[derive(Debug)]
pub struct MessageQueue {
    /// Timestamp of the oldest buffered AV message, -1 when none
    av_start_time: i64,
    /// Timestamp of the newest buffered AV message, -1 when none
    av_end_time: i64,
    queue_size_ms: i64,
    msgs: VecDeque<RtmpMessage>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            av_start_time: -1,
            av_end_time: -1,
            queue_size_ms: 0,
            msgs: VecDeque::new(),
        }
    }

    /// Cap the buffered AV duration
    pub fn set_queue_size(&mut self, seconds: f64) {
        self.queue_size_ms = (seconds * 1000.0) as i64;
    }

    pub fn size(&self) -> usize {
        self.msgs.len()
    }

    /// Buffered AV duration in milliseconds
    pub fn duration(&self) -> i64 {
        if self.av_start_time >= 0 && self.av_end_time >= self.av_start_time {
            self.av_end_time - self.av_start_time
        } else {
            0
        }
    }

    /// Append a message; returns true when the queue overflowed and shrank.
    pub fn enqueue(&mut self, msg: RtmpMessage) -> bool {
        if msg.header.is_av() {
            if self.av_start_time == -1 {
                self.av_start_time = msg.header.timestamp;
            }
            self.av_end_time = msg.header.timestamp;
        }

        self.msgs.push_back(msg);

        if self.queue_size_ms > 0 && self.duration() > self.queue_size_ms {
            self.shrink();
            return true;
        }
        false
    }

    /// Move up to `max_count` messages out, advancing the queue.
    pub fn dump_packets(&mut self, max_count: usize) -> Vec<RtmpMessage> {
        let count = max_count.min(self.msgs.len());
        let out: Vec<RtmpMessage> = self.msgs.drain(..count).collect();
        self.update_av_start();
        out
    }

    /// Drop whole GOPs from the front until the buffered duration fits (or
    /// the queue is empty). The front always lands on a video key frame, so
    /// the survivor is still decodable.
    fn shrink(&mut self) {
        let before = self.msgs.len();

        while self.duration() > self.queue_size_ms && !self.msgs.is_empty() {
            self.msgs.pop_front();
            while let Some(front) = self.msgs.front() {
                if front.header.is_video() && flv::is_video_keyframe(&front.payload) {
                    break;
                }
                self.msgs.pop_front();
            }
            self.update_av_start();
        }

        debug!(
            dropped = before - self.msgs.len(),
            remaining = self.msgs.len(),
            "queue overflow, shrink to key frame"
        );
    }

    pub fn clear(&mut self) {
        self.msgs.clear();
        self.av_start_time = -1;
        self.av_end_time = -1;
    }

    fn update_av_start(&mut self) {
        match self.msgs.iter().find(|m| m.header.is_av()) {
            Some(front) => self.av_start_time = front.header.timestamp,
            None => {
                self.av_start_time = -1;
                self.av_end_time = -1;
            }
        }
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Flush the mix queue for a pure audio/video stream after this many
/// messages of a single kind
const MIX_CORRECT_PURE_AV: u32 = 10;

/// Timestamp-ordered audio/video interleaver
#[derive(Debug, Default)]
pub struct MixQueue {
    nb_videos: u32,
    nb_audios: u32,
    msgs: BTreeMap<i64, VecDeque<RtmpMessage>>,
}

impl MixQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.msgs.values().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    pub fn clear(&mut self) {
        self.nb_videos = 0;
        self.nb_audios = 0;
        self.msgs.clear();
    }

    pub fn push(&mut self, msg: RtmpMessage) {
        if msg.header.is_video() {
            self.nb_videos += 1;
        } else if msg.header.is_audio() {
            self.nb_audios += 1;
        }
        self.msgs.entry(msg.header.timestamp).or_default().push_back(msg);
    }

    /// Pop the earliest message, but only once both kinds have been seen
    /// (or the stream proved to be pure audio / pure video).
    pub fn pop(&mut self) -> Option<RtmpMessage> {
        let mix_ok = (self.nb_videos > 0 && self.nb_audios > 0)
            || (self.nb_videos >= MIX_CORRECT_PURE_AV && self.nb_audios == 0)
            || (self.nb_audios >= MIX_CORRECT_PURE_AV && self.nb_videos == 0);
        if !mix_ok {
            return None;
        }

        let (&ts, _) = self.msgs.iter().next()?;
        let queue = self.msgs.get_mut(&ts)?;
        let msg = queue.pop_front()?;
        if queue.is_empty() {
            self.msgs.remove(&ts);
        }

        if msg.header.is_video() {
            self.nb_videos -= 1;
        } else if msg.header.is_audio() {
            self.nb_audios -= 1;
        }
        Some(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::MessageHeader;
    use bytes::Bytes;

    fn video(ts: i64, keyframe: bool) -> RtmpMessage {
        let first = if keyframe { 0x17 } else { 0x27 };
        let payload = Bytes::from(vec![first, 0x01]);
        RtmpMessage::new(MessageHeader::video(2, ts, 1), payload)
    }

    fn audio(ts: i64) -> RtmpMessage {
        RtmpMessage::new(MessageHeader::audio(2, ts, 1), Bytes::from_static(&[0xAF, 0x01]))
    }

    #[test]
    fn test_duration_tracks_av_bounds() {
        let mut queue = MessageQueue::new();
        queue.set_queue_size(30.0);

        assert_eq!(queue.duration(), 0);
        assert!(!queue.enqueue(video(100, true)));
        assert!(!queue.enqueue(audio(140)));
        assert!(!queue.enqueue(audio(180)));
        assert_eq!(queue.duration(), 80);
        assert_eq!(queue.size(), 3);
    }

    #[test]
    fn test_overflow_shrinks_to_keyframe() {
        let mut queue = MessageQueue::new();
        queue.set_queue_size(1.0); // 1000 ms cap

        queue.enqueue(video(0, true));
        queue.enqueue(video(400, false));
        queue.enqueue(video(800, true));
        // 1200 ms of content: overflow; everything before the keyframe at
        // 800 goes
        assert!(queue.enqueue(video(1200, false)));

        assert_eq!(queue.size(), 2);
        let msgs = queue.dump_packets(16);
        assert!(flv::is_video_keyframe(&msgs[0].payload));
        assert_eq!(msgs[0].header.timestamp, 800);
        // invariant: duration bounded or front is a key frame
        assert!(queue.duration() <= 1000);
    }

    #[test]
    fn test_shrink_without_keyframe_empties() {
        let mut queue = MessageQueue::new();
        queue.set_queue_size(1.0);

        queue.enqueue(audio(0));
        queue.enqueue(audio(600));
        assert!(queue.enqueue(audio(1200)));
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.duration(), 0);
    }

    #[test]
    fn test_dump_packets_advances() {
        let mut queue = MessageQueue::new();
        for i in 0..10 {
            queue.enqueue(audio(i * 40));
        }

        let first = queue.dump_packets(4);
        assert_eq!(first.len(), 4);
        assert_eq!(first[0].header.timestamp, 0);

        let rest = queue.dump_packets(100);
        assert_eq!(rest.len(), 6);
        assert_eq!(rest[0].header.timestamp, 160);
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn test_mix_queue_interleaves_by_timestamp() {
        let mut mix = MixQueue::new();

        // video arrives ahead of the audio that belongs before it
        mix.push(video(40, false));
        assert!(mix.pop().is_none(), "one kind only, hold");
        mix.push(audio(10));
        mix.push(audio(50));

        assert_eq!(mix.pop().unwrap().header.timestamp, 10);
        assert_eq!(mix.pop().unwrap().header.timestamp, 40);
        // the remaining audio is the only kind left: held again
        assert!(mix.pop().is_none());
        assert_eq!(mix.len(), 1);
    }

    #[test]
    fn test_mix_queue_pure_stream_flushes() {
        let mut mix = MixQueue::new();
        for i in 0..MIX_CORRECT_PURE_AV {
            mix.push(audio(i as i64 * 20));
            if i < MIX_CORRECT_PURE_AV - 1 {
                assert!(mix.pop().is_none());
            }
        }
        // a pure-audio stream must not deadlock
        assert_eq!(mix.pop().unwrap().header.timestamp, 0);
    }

    #[test]
    fn test_mix_queue_stable_within_timestamp() {
        let mut mix = MixQueue::new();
        mix.push(audio(40));
        mix.push(video(40, true));

        // same timestamp: arrival order preserved
        assert!(mix.pop().unwrap().header.is_audio());
        assert!(mix.pop().is_none());
    }
}

//! Timestamp jitter correction for the play path
//!
//! Publishers reconnect, encoders glitch, and absolute timecodes jump; a
//! consumer that forwards raw timestamps makes players stall or fast-skip.
//! FULL rewrites every AV timestamp into a monotonically non-decreasing
//! stream with bounded deltas, ZERO only rebases to start at zero, OFF
//! forwards untouched (ATC setups).

use crate::protocol::message::RtmpMessage;

/// Largest forward delta accepted as-is, in milliseconds
const MAX_JITTER_MS: i64 = 250;

/// Largest backward delta accepted as-is, in milliseconds
const MAX_JITTER_MS_NEG: i64 = -250;

/// Substitute frame time when the delta is out of band (25 fps)
const DEFAULT_FRAME_TIME_MS: i64 = 40;

/// Timestamp rewriting policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterAlgorithm {
    /// Rewrite into a zero-based, monotonic, bounded-delta stream
    Full,
    /// Rebase so the first message plays at timestamp zero
    Zero,
    /// Forward timestamps unmodified
    Off,
}

/// Per-consumer jitter state
#[derive(Debug)]
pub struct TimeJitter {
    last_pkt_time: i64,
    last_pkt_correct_time: i64,
}

impl TimeJitter {
    pub fn new() -> Self {
        Self {
            last_pkt_time: 0,
            last_pkt_correct_time: -1,
        }
    }

    /// Corrected time of the newest packet, for progress reporting
    pub fn time(&self) -> i64 {
        self.last_pkt_correct_time.max(0)
    }

    /// Rewrite `msg`'s timestamp per the algorithm.
    pub fn correct(&mut self, msg: &mut RtmpMessage, algorithm: JitterAlgorithm) {
        match algorithm {
            JitterAlgorithm::Off => {}
            JitterAlgorithm::Zero => {
                if self.last_pkt_correct_time == -1 {
                    self.last_pkt_correct_time = msg.header.timestamp;
                }
                msg.header.timestamp -= self.last_pkt_correct_time;
            }
            JitterAlgorithm::Full => self.correct_full(msg),
        }
    }

    fn correct_full(&mut self, msg: &mut RtmpMessage) {
        if !msg.header.is_av() {
            msg.header.timestamp = 0;
            return;
        }

        let time = msg.header.timestamp;
        let mut delta = time - self.last_pkt_time;

        if !(MAX_JITTER_MS_NEG..=MAX_JITTER_MS).contains(&delta) {
            delta = DEFAULT_FRAME_TIME_MS;
        }

        self.last_pkt_correct_time = (self.last_pkt_correct_time + delta).max(0);
        msg.header.timestamp = self.last_pkt_correct_time;
        self.last_pkt_time = time;
    }
}

impl Default for TimeJitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::MessageHeader;
    use bytes::Bytes;

    fn audio_at(ts: i64) -> RtmpMessage {
        RtmpMessage::new(MessageHeader::audio(2, ts, 1), Bytes::from_static(&[0xAF, 0x01]))
    }

    fn metadata_at(ts: i64) -> RtmpMessage {
        let mut msg = RtmpMessage::new(MessageHeader::amf0_data(2, 1), Bytes::from_static(&[0, 0]));
        msg.header.timestamp = ts;
        msg
    }

    #[test]
    fn test_full_smooth_stream_passes_through() {
        let mut jitter = TimeJitter::new();
        let mut out = Vec::new();
        for ts in [0i64, 40, 80, 120] {
            let mut msg = audio_at(ts);
            jitter.correct(&mut msg, JitterAlgorithm::Full);
            out.push(msg.header.timestamp);
        }
        // first delta lands on the -1 initial state, then 40 each
        assert_eq!(out, vec![0, 40, 80, 120]);
    }

    #[test]
    fn test_full_substitutes_wild_deltas() {
        let mut jitter = TimeJitter::new();

        let mut msg = audio_at(0);
        jitter.correct(&mut msg, JitterAlgorithm::Full);
        let first = msg.header.timestamp;

        // a 100 s jump forward is replaced with one 40 ms frame time
        let mut msg = audio_at(100_000);
        jitter.correct(&mut msg, JitterAlgorithm::Full);
        assert_eq!(msg.header.timestamp, first + DEFAULT_FRAME_TIME_MS);

        // and a jump back is too
        let mut msg = audio_at(50);
        jitter.correct(&mut msg, JitterAlgorithm::Full);
        assert_eq!(msg.header.timestamp, first + 2 * DEFAULT_FRAME_TIME_MS);
    }

    #[test]
    fn test_full_output_is_monotonic_with_bounded_deltas() {
        let inputs = [500i64, 540, 300_000, 300_020, 299_000, 299_040, 301_000];
        let mut jitter = TimeJitter::new();

        let mut last = 0i64;
        for (i, ts) in inputs.iter().enumerate() {
            let mut msg = audio_at(*ts);
            jitter.correct(&mut msg, JitterAlgorithm::Full);
            let t = msg.header.timestamp;
            if i > 0 {
                let delta = t - last;
                assert!(
                    (0..=MAX_JITTER_MS).contains(&delta) || delta == DEFAULT_FRAME_TIME_MS,
                    "delta {} out of contract",
                    delta
                );
                assert!(t >= last, "output regressed: {} < {}", t, last);
            }
            last = t;
        }
    }

    #[test]
    fn test_full_zeroes_non_av() {
        let mut jitter = TimeJitter::new();
        let mut msg = metadata_at(12345);
        jitter.correct(&mut msg, JitterAlgorithm::Full);
        assert_eq!(msg.header.timestamp, 0);
    }

    #[test]
    fn test_zero_rebases() {
        let mut jitter = TimeJitter::new();
        for (input, expected) in [(1000i64, 0i64), (1040, 40), (1100, 100)] {
            let mut msg = audio_at(input);
            jitter.correct(&mut msg, JitterAlgorithm::Zero);
            assert_eq!(msg.header.timestamp, expected);
        }
    }

    #[test]
    fn test_off_is_noop() {
        let mut jitter = TimeJitter::new();
        let mut msg = audio_at(987654);
        jitter.correct(&mut msg, JitterAlgorithm::Off);
        assert_eq!(msg.header.timestamp, 987654);
    }
}

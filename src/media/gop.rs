//! GOP cache for late-joiner support
//!
//! A player joining mid-stream needs a video key frame before it can decode
//! anything. The cache remembers every AV message from the last key frame
//! forward; on attach the source dumps it into the new consumer's queue, so
//! playback starts immediately instead of stalling until the next key frame.

use tracing::debug;

use crate::media::flv;
use crate::protocol::message::RtmpMessage;

/// Ring of AV messages from the last video key frame forward
#[derive(Debug, Default)]
pub struct GopCache {
    enabled: bool,
    /// Cached run; front is the anchoring key frame
    msgs: Vec<RtmpMessage>,
    /// Video frames cached since the anchor; audio-only input stays uncached
    cached_video_count: usize,
}

impl GopCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            msgs: Vec::new(),
            cached_video_count: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Offer an AV message to the cache.
    pub fn cache(&mut self, msg: &RtmpMessage) {
        if !self.enabled {
            return;
        }

        if msg.header.is_video() {
            // a key frame restarts the group
            if flv::is_video_keyframe(&msg.payload) {
                self.msgs.clear();
                self.cached_video_count = 0;
            }
            self.cached_video_count += 1;
        } else if self.cached_video_count == 0 {
            // pure-audio run before any video: nothing to anchor on
            return;
        }

        self.msgs.push(msg.clone());
    }

    /// Messages cached since the anchoring key frame, in arrival order
    pub fn dump(&self) -> &[RtmpMessage] {
        &self.msgs
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    /// Drop everything (publisher restart, metadata change)
    pub fn clear(&mut self) {
        if !self.msgs.is_empty() {
            debug!(msgs = self.msgs.len(), "clear gop cache");
        }
        self.msgs.clear();
        self.cached_video_count = 0;
    }
}

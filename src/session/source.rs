//! Per-stream broadcast hub and the process-wide source registry
//!
//! One [`Source`] exists per canonical stream URL. It admits at most one
//! publisher, caches the metadata and sequence headers a late joiner needs,
//! feeds the GOP cache, and fans every AV message out to the attached
//! consumers. The registry maps stream URLs to sources and reaps the ones
//! nobody has touched for a while.
//!
//! Fan-out runs under the source's single state lock, so every consumer
//! observes messages in exactly the publisher's send order; a slow consumer
//! only ever loses its oldest GOP to queue shrinking, never sees
//! reordering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::media::{flv, GopCache};
use crate::protocol::constants::SOURCE_DIE_TIMEOUT;
use crate::protocol::message::{MessageHeader, RtmpMessage};
use crate::protocol::packet::{OnMetadataPacket, Packet};
use crate::server::config::VhostConfig;
use crate::session::consumer::Consumer;
use crate::session::jitter::JitterAlgorithm;
use crate::session::queue::MixQueue;
use crate::session::request::Request;

static NEXT_SOURCE_ID: AtomicI32 = AtomicI32::new(100);

/// Stream lifecycle notifications (DVR, relays, stats hang off this seam)
#[async_trait]
pub trait SourceHandler: Send + Sync {
    async fn on_publish(&self, req: &Request);
    async fn on_unpublish(&self, req: &Request);
}

struct SourceInner {
    /// Reorder AV by timestamp before fan-out
    mix_correct: bool,
    /// Armed until the publisher's timestamps regress once
    is_monotonically_increase: bool,
    last_packet_time: i64,
    cache_metadata: Option<RtmpMessage>,
    cache_sh_video: Option<RtmpMessage>,
    cache_sh_audio: Option<RtmpMessage>,
    consumers: Vec<Weak<Consumer>>,
    mix_queue: MixQueue,
    gop_cache: GopCache,
    /// Reap deadline; None while a publisher or consumer keeps us alive
    die_at: Option<Instant>,
}

/// Per-stream publish/play hub
pub struct Source {
    stream_url: String,
    req: Request,
    handler: Arc<dyn SourceHandler>,
    atc: bool,
    jitter_algorithm: JitterAlgorithm,
    queue_size_secs: f64,
    can_publish: AtomicBool,
    source_id: AtomicI32,
    prev_source_id: AtomicI32,
    inner: Mutex<SourceInner>,
}

impl Source {
    fn new(req: &Request, vhost: &VhostConfig, handler: Arc<dyn SourceHandler>) -> Self {
        let id = NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            stream_url: req.stream_url(),
            req: req.clone(),
            handler,
            atc: vhost.atc,
            jitter_algorithm: vhost.jitter_algorithm,
            queue_size_secs: vhost.queue_length.as_secs_f64(),
            can_publish: AtomicBool::new(true),
            source_id: AtomicI32::new(id),
            prev_source_id: AtomicI32::new(id),
            inner: Mutex::new(SourceInner {
                mix_correct: vhost.mix_correct,
                is_monotonically_increase: true,
                last_packet_time: 0,
                cache_metadata: None,
                cache_sh_video: None,
                cache_sh_audio: None,
                consumers: Vec::new(),
                mix_queue: MixQueue::new(),
                gop_cache: GopCache::new(vhost.gop_cache),
                // fresh sources die quietly if nobody follows up
                die_at: Some(Instant::now() + SOURCE_DIE_TIMEOUT),
            }),
        }
    }

    pub fn stream_url(&self) -> &str {
        &self.stream_url
    }

    pub fn request(&self) -> &Request {
        &self.req
    }

    pub fn source_id(&self) -> i32 {
        self.source_id.load(Ordering::Relaxed)
    }

    pub fn prev_source_id(&self) -> i32 {
        self.prev_source_id.load(Ordering::Relaxed)
    }

    /// True while no publisher holds this stream
    pub fn can_publish(&self, _is_edge: bool) -> bool {
        self.can_publish.load(Ordering::Acquire)
    }

    /// A publisher takes the stream: bump the source id, reset the
    /// monotonic/mix state, and notify the handler. Fails with `StreamBusy`
    /// while another publisher is active.
    pub async fn on_publish(&self) -> Result<()> {
        // swap doubles as the admission test: a false previous value means
        // someone else already holds the stream
        if !self.can_publish.swap(false, Ordering::AcqRel) {
            return Err(Error::StreamBusy(self.stream_url.clone()));
        }

        {
            let mut inner = self.inner.lock().expect("source lock");
            inner.is_monotonically_increase = true;
            inner.last_packet_time = 0;
            inner.mix_queue.clear();
            inner.die_at = None;

            for consumer in inner.consumers.iter().filter_map(Weak::upgrade) {
                consumer.update_source_id();
            }
        }

        let id = self.source_id.load(Ordering::Relaxed);
        self.prev_source_id.store(id, Ordering::Relaxed);
        self.source_id
            .store(NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);

        info!(stream = %self.stream_url, source_id = self.source_id(), "publish stream");

        self.handler.on_publish(&self.req).await;
        Ok(())
    }

    /// The publisher left: drop the AV caches (metadata survives for the
    /// next publisher), arm the reap deadline, reopen admission.
    pub async fn on_unpublish(&self) {
        {
            let mut inner = self.inner.lock().expect("source lock");
            inner.cache_sh_video = None;
            inner.cache_sh_audio = None;
            inner.gop_cache.clear();
            inner.mix_queue.clear();
            inner.die_at = Some(Instant::now() + SOURCE_DIE_TIMEOUT);
        }

        self.can_publish.store(true, Ordering::Release);
        info!(stream = %self.stream_url, "unpublish stream");

        self.handler.on_unpublish(&self.req).await;
    }

    /// Publisher-side entry for an audio message
    pub fn on_audio(&self, msg: RtmpMessage) {
        self.on_av(msg);
    }

    /// Publisher-side entry for a video message
    pub fn on_video(&self, msg: RtmpMessage) {
        self.on_av(msg);
    }

    fn on_av(&self, msg: RtmpMessage) {
        // consumers woken during fan-out must not be dropped while the
        // state lock is held; park the refs and release them after
        let mut keepalive: Vec<Arc<Consumer>> = Vec::new();
        let mut inner = self.inner.lock().expect("source lock");

        let timestamp = msg.header.timestamp;
        if inner.is_monotonically_increase
            && inner.last_packet_time > 0
            && timestamp < inner.last_packet_time
        {
            inner.is_monotonically_increase = false;
            warn!(
                stream = %self.stream_url,
                last = inner.last_packet_time,
                current = timestamp,
                "AV timestamp regressed, fall back to mix-correct"
            );
            inner.mix_correct = true;
        }
        inner.last_packet_time = timestamp;

        if inner.mix_correct {
            inner.mix_queue.push(msg);
            while let Some(mixed) = inner.mix_queue.pop() {
                self.dispatch_av(&mut inner, mixed, &mut keepalive);
            }
        } else {
            self.dispatch_av(&mut inner, msg, &mut keepalive);
        }

        drop(inner);
        drop(keepalive);
    }

    fn dispatch_av(
        &self,
        inner: &mut MutexGuard<'_, SourceInner>,
        msg: RtmpMessage,
        keepalive: &mut Vec<Arc<Consumer>>,
    ) {
        if msg.header.is_audio() {
            if flv::is_audio_sequence_header(&msg.payload) {
                debug!(stream = %self.stream_url, size = msg.len(), "update audio sequence header");
                inner.cache_sh_audio = Some(msg.clone());
            }
        } else if flv::is_video_sequence_header(&msg.payload) {
            debug!(stream = %self.stream_url, size = msg.len(), "update video sequence header");
            inner.cache_sh_video = Some(msg.clone());
        }

        inner.gop_cache.cache(&msg);

        inner.consumers.retain(|weak| weak.strong_count() > 0);
        for consumer in inner.consumers.iter().filter_map(Weak::upgrade) {
            consumer.enqueue(msg.clone(), self.atc, self.jitter_algorithm);
            keepalive.push(consumer);
        }
    }

    /// Publisher-side entry for onMetaData / @setDataFrame
    pub fn on_metadata(&self, packet: &OnMetadataPacket) -> Result<()> {
        // re-encode as a bare onMetaData data message for caching and fan-out
        let payload = Packet::OnMetadata(packet.clone()).encode_payload()?;
        let msg = RtmpMessage::new(
            MessageHeader::amf0_data(payload.len() as u32, 0),
            payload,
        );

        let mut keepalive: Vec<Arc<Consumer>> = Vec::new();
        {
            let mut inner = self.inner.lock().expect("source lock");
            inner.cache_metadata = Some(msg.clone());
            // a metadata change invalidates the cached group of pictures
            inner.gop_cache.clear();

            inner.consumers.retain(|weak| weak.strong_count() > 0);
            for consumer in inner.consumers.iter().filter_map(Weak::upgrade) {
                consumer.enqueue(msg.clone(), self.atc, self.jitter_algorithm);
                keepalive.push(consumer);
            }
        }

        info!(stream = %self.stream_url, "update metadata");
        Ok(())
    }

    /// Attach a new play session.
    ///
    /// Hydration order is metadata, video sequence header, audio sequence
    /// header, then the GOP cache, so the player can decode from the first
    /// delivered frame. `ds`/`dm`/`dg` gate sequence headers, metadata, and
    /// the GOP respectively.
    pub fn create_consumer(self: &Arc<Self>, ds: bool, dm: bool, dg: bool) -> Arc<Consumer> {
        let consumer = Arc::new(Consumer::new(Arc::downgrade(self), self.queue_size_secs));

        let mut inner = self.inner.lock().expect("source lock");
        inner.consumers.push(Arc::downgrade(&consumer));
        inner.die_at = None;

        if dm {
            if let Some(meta) = &inner.cache_metadata {
                consumer.enqueue(meta.clone(), self.atc, self.jitter_algorithm);
            }
        }
        if ds {
            if let Some(sh) = &inner.cache_sh_video {
                consumer.enqueue(sh.clone(), self.atc, self.jitter_algorithm);
            }
            if let Some(sh) = &inner.cache_sh_audio {
                consumer.enqueue(sh.clone(), self.atc, self.jitter_algorithm);
            }
        }
        if dg {
            for msg in inner.gop_cache.dump() {
                consumer.enqueue(msg.clone(), self.atc, self.jitter_algorithm);
            }
        }

        debug!(
            stream = %self.stream_url,
            consumers = inner.consumers.len(),
            hydrated = consumer.queue_len(),
            "consumer attached"
        );
        drop(inner);

        consumer
    }

    /// Detach a consumer (called from its Drop)
    pub(crate) fn on_consumer_destroy(&self, consumer: &Consumer) {
        let mut inner = self.inner.lock().expect("source lock");
        let target = consumer as *const Consumer;
        inner
            .consumers
            .retain(|weak| weak.as_ptr() != target && weak.strong_count() > 0);

        if inner.consumers.is_empty() && self.can_publish.load(Ordering::Acquire) {
            inner.die_at = Some(Instant::now() + SOURCE_DIE_TIMEOUT);
        }
        debug!(stream = %self.stream_url, consumers = inner.consumers.len(), "consumer detached");
    }

    /// Ready to be reaped: no publisher, no consumers, deadline passed
    fn expired(&self) -> bool {
        if !self.can_publish.load(Ordering::Acquire) {
            return false;
        }

        let inner = self.inner.lock().expect("source lock");
        if inner.consumers.iter().any(|weak| weak.strong_count() > 0) {
            return false;
        }

        matches!(inner.die_at, Some(deadline) if Instant::now() >= deadline)
    }

    #[cfg(test)]
    fn consumer_count(&self) -> usize {
        self.inner
            .lock()
            .expect("source lock")
            .consumers
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

/// Process-wide stream URL -> source mapping
#[derive(Default)]
pub struct SourceRegistry {
    pool: Mutex<HashMap<String, Arc<Source>>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the source for a request, creating it on first touch.
    pub fn fetch_or_create(
        &self,
        req: &Request,
        vhost: &VhostConfig,
        handler: &Arc<dyn SourceHandler>,
    ) -> Arc<Source> {
        let mut pool = self.pool.lock().expect("registry lock");
        let url = req.stream_url();

        if let Some(source) = pool.get(&url) {
            return Arc::clone(source);
        }

        let source = Arc::new(Source::new(req, vhost, Arc::clone(handler)));
        info!(stream = %url, "create new source");
        pool.insert(url, Arc::clone(&source));
        source
    }

    /// Read-only lookup
    pub fn fetch(&self, req: &Request) -> Option<Arc<Source>> {
        self.pool
            .lock()
            .expect("registry lock")
            .get(&req.stream_url())
            .cloned()
    }

    /// Reap sources whose deadline passed; run every second or so.
    pub fn cycle_all(&self) {
        let mut pool = self.pool.lock().expect("registry lock");
        pool.retain(|url, source| {
            if source.expired() {
                info!(stream = %url, "cleanup idle source");
                false
            } else {
                true
            }
        });
    }

    pub fn len(&self) -> usize {
        self.pool.lock().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    struct NullHandler;

    #[async_trait]
    impl SourceHandler for NullHandler {
        async fn on_publish(&self, _req: &Request) {}
        async fn on_unpublish(&self, _req: &Request) {}
    }

    fn test_request(stream: &str) -> Request {
        let mut req = Request::new();
        req.tc_url = "rtmp://127.0.0.1/live".to_string();
        req.stream = stream.to_string();
        req.discover();
        req
    }

    fn test_source(stream: &str) -> Arc<Source> {
        let handler: Arc<dyn SourceHandler> = Arc::new(NullHandler);
        let registry = SourceRegistry::new();
        registry.fetch_or_create(&test_request(stream), &VhostConfig::default(), &handler)
    }

    fn video(ts: i64, keyframe: bool) -> RtmpMessage {
        let first = if keyframe { 0x17 } else { 0x27 };
        RtmpMessage::new(
            MessageHeader::video(3, ts, 1),
            Bytes::from(vec![first, 0x01, 0x00]),
        )
    }

    fn video_sh(ts: i64) -> RtmpMessage {
        RtmpMessage::new(
            MessageHeader::video(3, ts, 1),
            Bytes::from_static(&[0x17, 0x00, 0x01]),
        )
    }

    fn audio(ts: i64) -> RtmpMessage {
        RtmpMessage::new(
            MessageHeader::audio(2, ts, 1),
            Bytes::from(vec![0xAF, 0x01]),
        )
    }

    fn audio_sh(ts: i64) -> RtmpMessage {
        RtmpMessage::new(
            MessageHeader::audio(2, ts, 1),
            Bytes::from_static(&[0xAF, 0x00]),
        )
    }

    fn metadata_packet() -> OnMetadataPacket {
        let mut obj = crate::amf::Amf0Object::new();
        obj.set("width", 1920.0);
        OnMetadataPacket { metadata: crate::amf::AmfValue::EcmaArray(obj) }
    }

    #[tokio::test]
    async fn test_publisher_admission() {
        let source = test_source("cam01");

        assert!(source.can_publish(false));
        source.on_publish().await.unwrap();
        // second publisher is refused while the first is active
        assert!(!source.can_publish(false));
        assert!(matches!(
            source.on_publish().await,
            Err(Error::StreamBusy(_))
        ));

        source.on_unpublish().await;
        assert!(source.can_publish(false));
    }

    #[tokio::test]
    async fn test_source_id_bumps_on_publish() {
        let source = test_source("cam02");
        let original = source.source_id();

        source.on_publish().await.unwrap();
        assert_ne!(source.source_id(), original);
        assert_eq!(source.prev_source_id(), original);
    }

    #[tokio::test]
    async fn test_fan_out_order_and_completeness() {
        let source = test_source("cam03");
        source.on_publish().await.unwrap();

        let c1 = source.create_consumer(true, true, true);
        let c2 = source.create_consumer(true, true, true);

        for i in 0..10 {
            source.on_video(video(i * 40, i == 0));
            source.on_audio(audio(i * 40 + 10));
        }

        for consumer in [&c1, &c2] {
            let msgs = consumer.dump_packets(64);
            assert_eq!(msgs.len(), 20, "every message reaches every consumer");
            // publisher order preserved pairwise
            let times: Vec<i64> = msgs.iter().map(|m| m.header.timestamp).collect();
            let mut sorted = times.clone();
            sorted.sort();
            assert_eq!(times, sorted);
        }
    }

    #[tokio::test]
    async fn test_late_joiner_hydration_order() {
        let source = test_source("cam04");
        source.on_publish().await.unwrap();

        source.on_metadata(&metadata_packet()).unwrap();
        source.on_audio(audio_sh(0));
        source.on_video(video_sh(0));
        source.on_video(video(40, true));
        source.on_video(video(80, false));
        source.on_audio(audio(90));

        let consumer = source.create_consumer(true, true, true);
        let msgs = consumer.dump_packets(64);

        // metadata, video sh, audio sh, then the GOP from the key frame on
        assert!(msgs[0].header.is_amf0_data());
        assert!(msgs[1].header.is_video());
        assert!(flv::is_video_sequence_header(&msgs[1].payload));
        assert!(msgs[2].header.is_audio());
        assert!(flv::is_audio_sequence_header(&msgs[2].payload));
        assert!(flv::is_video_keyframe(&msgs[3].payload));
        assert_eq!(msgs[3].header.timestamp, 40);
        assert_eq!(msgs.len(), 6);
    }

    #[tokio::test]
    async fn test_unpublish_keeps_metadata_drops_av_caches() {
        let source = test_source("cam05");
        source.on_publish().await.unwrap();

        source.on_metadata(&metadata_packet()).unwrap();
        source.on_video(video_sh(0));
        source.on_audio(audio_sh(0));
        source.on_video(video(40, true));

        source.on_unpublish().await;

        let consumer = source.create_consumer(true, true, true);
        let msgs = consumer.dump_packets(64);
        assert_eq!(msgs.len(), 1, "only metadata survives unpublish");
        assert!(msgs[0].header.is_amf0_data());
    }

    #[tokio::test]
    async fn test_consumer_detach_on_drop() {
        let source = test_source("cam06");
        let consumer = source.create_consumer(true, true, true);
        assert_eq!(source.consumer_count(), 1);

        drop(consumer);
        assert_eq!(source.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_timestamp_regression_enables_mix_correct() {
        let source = test_source("cam07");
        source.on_publish().await.unwrap();
        let consumer = source.create_consumer(true, true, true);

        source.on_video(video(1000, true));
        source.on_audio(audio(1040));
        // regression: mix-correct kicks in, later messages still flow
        source.on_video(video(500, true));
        source.on_audio(audio(520));
        source.on_video(video(540, false));
        source.on_audio(audio(560));

        // the mix queue holds messages until both kinds are seen, so at
        // least the pre-regression messages plus a mixed prefix arrived
        let msgs = consumer.dump_packets(64);
        assert!(msgs.len() >= 4);
        // mixed output remains in non-decreasing timestamp order after the
        // regression point
        let after: Vec<i64> = msgs
            .iter()
            .skip(2)
            .map(|m| m.header.timestamp)
            .collect();
        let mut sorted = after.clone();
        sorted.sort();
        assert_eq!(after, sorted);
    }

    #[tokio::test]
    async fn test_registry_fetch_or_create_is_idempotent() {
        let handler: Arc<dyn SourceHandler> = Arc::new(NullHandler);
        let registry = SourceRegistry::new();
        let req = test_request("cam08");

        let a = registry.fetch_or_create(&req, &VhostConfig::default(), &handler);
        let b = registry.fetch_or_create(&req, &VhostConfig::default(), &handler);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);

        assert!(registry.fetch(&req).is_some());
        assert!(registry.fetch(&test_request("other")).is_none());
    }

    #[tokio::test]
    async fn test_cycle_all_keeps_live_sources() {
        let handler: Arc<dyn SourceHandler> = Arc::new(NullHandler);
        let registry = SourceRegistry::new();
        let req = test_request("cam09");

        let source = registry.fetch_or_create(&req, &VhostConfig::default(), &handler);
        source.on_publish().await.unwrap();

        // an active publisher is never reaped, whatever the deadline says
        registry.cycle_all();
        assert_eq!(registry.len(), 1);
    }
}

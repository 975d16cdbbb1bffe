//! Per-connection state machine
//!
//! One task per accepted socket drives handshake, connect, identify, and
//! then either the publishing or the playing loop:
//!
//! ```text
//! handshaking -> connecting -> identifying -> publishing
//!                                   ^             |  (terminal)
//!                                   |          playing
//!                                   +-- ControlRepublish
//! ```
//!
//! Publishing hands the read half to a [`PublishRecvThread`] that feeds the
//! source; the main task only watches for inactivity and emits due acks.
//! Playing hands the read half to a [`QueueRecvThread`] and pumps the
//! consumer's queue into merged writes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::constants::*;
use crate::protocol::handshake;
use crate::protocol::packet::{
    CreateStreamResPacket, FmleStartResPacket, OnStatusCallPacket, OnStatusDataPacket,
    SampleAccessPacket, SetChunkSizePacket, SetPeerBandwidthPacket, SetWindowAckSizePacket,
    UserControlEvent, UserControlPacket,
};
use crate::protocol::stack::{AckWindow, MessageReader, MessageWriter};
use crate::protocol::{Packet, RtmpMessage, Transactions};
use crate::server::config::{ServerConfig, VhostConfig};
use crate::server::recv::{PublishRecvThread, PublishSignal, QueueRecvThread};
use crate::session::consumer::Consumer;
use crate::session::request::Request;
use crate::session::source::{Source, SourceHandler, SourceRegistry};

/// The message stream id handed out by createStream
const RESPONSE_STREAM_ID: u32 = 1;

/// What the identify phase decided the client is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientType {
    /// releaseStream + FCPublish + createStream + publish
    FmlePublish,
    /// createStream + publish (or a bare publish)
    FlashPublish,
    /// FCPublish with no releaseStream first
    HivisionPublish,
    /// createStream + play
    Play,
}

#[derive(Default)]
struct ConnFlags {
    disposed: AtomicBool,
    expired: AtomicBool,
    /// Parked consumer to kick when the connection is told to go away
    wakeable: Mutex<Option<Arc<Consumer>>>,
}

impl ConnFlags {
    fn wake(&self) {
        if let Some(consumer) = self.wakeable.lock().expect("wakeable slot").as_ref() {
            consumer.wake_up();
        }
    }
}

/// Administrative handle to a running connection
#[derive(Clone)]
pub struct ConnectionHandle {
    flags: Arc<ConnFlags>,
}

impl ConnectionHandle {
    /// Expire the connection; its loops exit with `UserDisconnect`.
    pub fn expire(&self) {
        self.flags.expired.store(true, Ordering::Release);
        self.flags.wake();
    }

    /// Tear the connection down without the error path.
    pub fn dispose(&self) {
        self.flags.disposed.store(true, Ordering::Release);
        self.flags.expired.store(true, Ordering::Release);
        self.flags.wake();
    }
}

/// One accepted socket's session
pub struct Connection<R, W> {
    session_id: u64,
    ip: String,
    config: ServerConfig,
    registry: Arc<SourceRegistry>,
    handler: Arc<dyn SourceHandler>,
    transactions: Arc<Transactions>,
    /// Taken by the publish/play receive task, returned on republish
    reader: Option<MessageReader<R>>,
    writer: MessageWriter<W>,
    ack: Arc<AckWindow>,
    request: Request,
    vhost: VhostConfig,
    flags: Arc<ConnFlags>,
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        session_id: u64,
        ip: String,
        reader: R,
        writer: W,
        config: ServerConfig,
        registry: Arc<SourceRegistry>,
        handler: Arc<dyn SourceHandler>,
    ) -> Self {
        let transactions = Arc::new(Transactions::new());
        let reader = MessageReader::new(reader, Arc::clone(&transactions));
        let ack = reader.ack_window();
        let writer = MessageWriter::new(writer, Arc::clone(&transactions));

        let mut request = Request::new();
        request.ip = ip.clone();

        Self {
            session_id,
            ip,
            config: config.clone(),
            registry,
            handler,
            transactions,
            reader: Some(reader),
            writer,
            ack,
            request,
            vhost: config.default_vhost.clone(),
            flags: Arc::new(ConnFlags::default()),
        }
    }

    /// Handle for administrative expiry
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle { flags: Arc::clone(&self.flags) }
    }

    /// Drive the connection to completion.
    pub async fn run(&mut self) -> Result<()> {
        let deadline = self.config.connect_timeout;
        timeout(deadline, self.initialize())
            .await
            .map_err(|_| Error::SocketTimeout)??;

        loop {
            if self.disposed() {
                return Ok(());
            }

            match self.stream_service_cycle().await {
                // the session only restarts if the read half came back from
                // the receive task
                Ok(()) if self.reader.is_some() => continue,
                Ok(()) => return Ok(()),
                Err(Error::ControlRepublish) if self.reader.is_some() => {
                    debug!(session_id = self.session_id, "republish, identify again");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn disposed(&self) -> bool {
        self.flags.disposed.load(Ordering::Acquire)
    }

    fn expired(&self) -> bool {
        self.flags.expired.load(Ordering::Acquire)
    }

    /// Handshake, connect, and the control-burst response
    async fn initialize(&mut self) -> Result<()> {
        let reader = self.reader.as_mut().expect("reader present");
        handshake::serve(reader.buffer(), self.writer.inner_mut()).await?;
        debug!(session_id = self.session_id, "handshake done");

        let connect = loop {
            let msg = self.recv_interleaved().await?;
            if !msg.header.is_amf0_command() && !msg.header.is_amf3_command() {
                continue;
            }
            if let Packet::Connect(p) = Packet::decode(&msg, &self.transactions)? {
                break p;
            }
        };

        self.request.tc_url = connect
            .tc_url()
            .ok_or_else(|| Error::TcUrlInvalid("connect without tcUrl".into()))?
            .to_string();
        self.request.object_encoding = connect.object_encoding();
        if let Some(url) = connect.command_object.get_str("pageUrl") {
            self.request.page_url = url.to_string();
        }
        if let Some(url) = connect.command_object.get_str("swfUrl") {
            self.request.swf_url = url.to_string();
        }
        self.request.args = connect.args.clone();
        self.request.discover();

        if self.request.schema.is_empty()
            || self.request.vhost.is_empty()
            || self.request.app.is_empty()
        {
            return Err(Error::TcUrlInvalid(self.request.tc_url.clone()));
        }

        self.vhost = self.config.vhost_config(&self.request.vhost).clone();

        self.writer
            .send_packet(
                &Packet::SetWindowAckSize(SetWindowAckSizePacket::new(self.config.window_ack_size)),
                0,
            )
            .await?;
        self.writer
            .send_packet(
                &Packet::SetPeerBandwidth(SetPeerBandwidthPacket::dynamic(
                    self.config.peer_bandwidth,
                )),
                0,
            )
            .await?;
        self.writer
            .send_packet(
                &Packet::SetChunkSize(SetChunkSizePacket::new(self.vhost.chunk_size)),
                0,
            )
            .await?;
        self.writer
            .send_packet(
                &Packet::ConnectRes(crate::protocol::packet::ConnectResPacket::accepted(
                    self.request.object_encoding,
                )),
                0,
            )
            .await?;

        info!(
            session_id = self.session_id,
            ip = %self.ip,
            tc_url = %self.request.tc_url,
            vhost = %self.request.vhost,
            app = %self.request.app,
            "client connected"
        );
        Ok(())
    }

    /// Identify the client and run its terminal loop once.
    async fn stream_service_cycle(&mut self) -> Result<()> {
        let (client_type, stream_name, duration) = self.identify().await?;

        self.request.stream = stream_name;
        self.request.duration = duration;
        self.request.discover();
        self.vhost = self.config.vhost_config(&self.request.vhost).clone();

        if self.request.stream.is_empty() {
            return Err(Error::StreamNameEmpty);
        }

        let source = self
            .registry
            .fetch_or_create(&self.request, &self.vhost, &self.handler);
        info!(
            session_id = self.session_id,
            client_type = ?client_type,
            stream = %source.stream_url(),
            "client identified"
        );

        match client_type {
            ClientType::FmlePublish => {
                self.start_fmle_publish().await?;
                self.publishing(&source, true).await
            }
            ClientType::HivisionPublish => {
                self.start_hivision_publish().await?;
                self.publishing(&source, true).await
            }
            ClientType::FlashPublish => {
                self.start_flash_publish().await?;
                self.publishing(&source, false).await
            }
            ClientType::Play => {
                self.start_play().await?;
                self.playing(&source).await
            }
        }
    }

    /// Classify the client from its command sequence after connect.
    async fn identify(&mut self) -> Result<(ClientType, String, f64)> {
        loop {
            let msg = self.recv_interleaved().await?;
            if !msg.header.is_amf0_command() && !msg.header.is_amf3_command() {
                continue;
            }

            match Packet::decode(&msg, &self.transactions)? {
                Packet::CreateStream(p) => {
                    self.writer
                        .send_packet(
                            &Packet::CreateStreamRes(CreateStreamResPacket::new(
                                p.transaction_id,
                                RESPONSE_STREAM_ID,
                            )),
                            0,
                        )
                        .await?;
                    return self.identify_create_stream().await;
                }
                Packet::FmleStart(p) if p.command_name == CMD_RELEASE_STREAM => {
                    self.writer
                        .send_packet(
                            &Packet::FmleStartRes(FmleStartResPacket::new(p.transaction_id)),
                            0,
                        )
                        .await?;
                    return Ok((ClientType::FmlePublish, p.stream_name, -1.0));
                }
                Packet::FmleStart(p) if p.command_name == CMD_FC_PUBLISH => {
                    // hivision encoders skip releaseStream and lead with
                    // FCPublish
                    self.writer
                        .send_packet(
                            &Packet::FmleStartRes(FmleStartResPacket::new(p.transaction_id)),
                            0,
                        )
                        .await?;
                    return Ok((ClientType::HivisionPublish, p.stream_name, -1.0));
                }
                Packet::Publish(p) => {
                    return Ok((ClientType::FlashPublish, p.stream_name, -1.0));
                }
                Packet::Play(p) => {
                    return Ok((ClientType::Play, p.stream_name, p.duration));
                }
                Packet::Call(p) => {
                    debug!(command = %p.command_name, "ignore command while identifying");
                }
                _ => {}
            }
        }
    }

    /// After createStream: the next publish/play decides the type.
    async fn identify_create_stream(&mut self) -> Result<(ClientType, String, f64)> {
        loop {
            let msg = self.recv_interleaved().await?;
            if !msg.header.is_amf0_command() && !msg.header.is_amf3_command() {
                continue;
            }

            match Packet::decode(&msg, &self.transactions)? {
                Packet::Publish(p) => {
                    return Ok((ClientType::FlashPublish, p.stream_name, -1.0));
                }
                Packet::Play(p) => {
                    return Ok((ClientType::Play, p.stream_name, p.duration));
                }
                Packet::CreateStream(p) => {
                    self.writer
                        .send_packet(
                            &Packet::CreateStreamRes(CreateStreamResPacket::new(
                                p.transaction_id,
                                RESPONSE_STREAM_ID,
                            )),
                            0,
                        )
                        .await?;
                }
                _ => {}
            }
        }
    }

    /// Finish the FMLE start: FCPublish, createStream, publish.
    async fn start_fmle_publish(&mut self) -> Result<()> {
        let fc_publish_tid = self
            .expect(|packet| match packet {
                Packet::FmleStart(p) if p.command_name == CMD_FC_PUBLISH => {
                    Some(p.transaction_id)
                }
                _ => None,
            })
            .await?;
        self.writer
            .send_packet(&Packet::FmleStartRes(FmleStartResPacket::new(fc_publish_tid)), 0)
            .await?;

        self.respond_create_stream_then_publish().await?;
        self.send_publish_start().await
    }

    /// Hivision start: the FCPublish leg was already answered in identify.
    async fn start_hivision_publish(&mut self) -> Result<()> {
        self.respond_create_stream_then_publish().await?;
        self.send_publish_start().await
    }

    async fn respond_create_stream_then_publish(&mut self) -> Result<()> {
        let create_tid = self
            .expect(|packet| match packet {
                Packet::CreateStream(p) => Some(p.transaction_id),
                _ => None,
            })
            .await?;
        self.writer
            .send_packet(
                &Packet::CreateStreamRes(CreateStreamResPacket::new(
                    create_tid,
                    RESPONSE_STREAM_ID,
                )),
                0,
            )
            .await?;

        self.expect(|packet| match packet {
            Packet::Publish(_) => Some(()),
            _ => None,
        })
        .await
    }

    async fn send_publish_start(&mut self) -> Result<()> {
        self.writer
            .send_packet(
                &Packet::OnStatusCall(OnStatusCallPacket::on_fc_publish(
                    "Started publishing stream.",
                )),
                0,
            )
            .await?;
        self.writer
            .send_packet(
                &Packet::OnStatusCall(OnStatusCallPacket::status(
                    NS_PUBLISH_START,
                    "Started publishing stream.",
                )),
                RESPONSE_STREAM_ID,
            )
            .await
    }

    /// Flash publish start: just the onStatus.
    async fn start_flash_publish(&mut self) -> Result<()> {
        self.writer
            .send_packet(
                &Packet::OnStatusCall(OnStatusCallPacket::status(
                    NS_PUBLISH_START,
                    "Started publishing stream.",
                )),
                RESPONSE_STREAM_ID,
            )
            .await
    }

    /// Play start: StreamBegin, reset/start statuses, sample access.
    async fn start_play(&mut self) -> Result<()> {
        self.writer
            .send_packet(
                &Packet::UserControl(UserControlPacket::stream_begin(RESPONSE_STREAM_ID)),
                0,
            )
            .await?;
        self.writer
            .send_packet(
                &Packet::OnStatusCall(OnStatusCallPacket::status(
                    NS_PLAY_RESET,
                    "Playing and resetting stream.",
                )),
                RESPONSE_STREAM_ID,
            )
            .await?;
        self.writer
            .send_packet(
                &Packet::OnStatusCall(OnStatusCallPacket::status(
                    NS_PLAY_START,
                    "Started playing stream.",
                )),
                RESPONSE_STREAM_ID,
            )
            .await?;
        self.writer
            .send_packet(&Packet::SampleAccess(SampleAccessPacket::new()), RESPONSE_STREAM_ID)
            .await?;
        self.writer
            .send_packet(
                &Packet::OnStatusData(OnStatusDataPacket::new("NetStream.Data.Start")),
                RESPONSE_STREAM_ID,
            )
            .await
    }

    /// Publisher terminal state.
    async fn publishing(&mut self, source: &Arc<Source>, is_fmle: bool) -> Result<()> {
        self.acquire_publish(source).await?;

        let mut reader = self.reader.take().expect("reader present");
        if self.vhost.mr_enabled {
            // merged read: let the drain task pull big slabs off the socket
            reader.set_recv_buffer(MAX_RECV_BUFFER_SIZE);
        }
        let thread = PublishRecvThread::spawn(
            reader,
            Arc::clone(source),
            Arc::clone(&self.transactions),
            is_fmle,
        );
        let signal = thread.signal();

        let result = self.do_publishing(&signal).await;

        if let Some(reader) = thread.stop().await {
            self.reader = Some(reader);
        }

        if is_fmle && matches!(result, Err(Error::ControlRepublish)) {
            if let Some(tid) = signal.unpublish_transaction_id() {
                self.fmle_unpublish(tid).await?;
            }
        }

        source.on_unpublish().await;
        result
    }

    async fn acquire_publish(&mut self, source: &Arc<Source>) -> Result<()> {
        if !source.can_publish(self.vhost.is_edge) || source.on_publish().await.is_err() {
            warn!(
                session_id = self.session_id,
                stream = %source.stream_url(),
                "stream is busy, reject publisher"
            );
            self.writer
                .send_packet(
                    &Packet::OnStatusCall(OnStatusCallPacket::error(
                        NS_PUBLISH_BAD_NAME,
                        "Stream already publishing",
                    )),
                    RESPONSE_STREAM_ID,
                )
                .await?;
            // the active publisher's source is not ours to unpublish
            return Err(Error::SystemStreamBusy(source.stream_url().to_string()));
        }

        Ok(())
    }

    /// Watch the recv task for progress; a stall is a dead publisher.
    async fn do_publishing(&mut self, signal: &Arc<PublishSignal>) -> Result<()> {
        let first_timeout = self.vhost.publish_first_pkt_timeout;
        let normal_timeout = self.vhost.publish_normal_pkt_timeout;
        let mut nb_msgs: u64 = 0;

        loop {
            if self.expired() {
                return Err(Error::UserDisconnect);
            }
            if self.disposed() {
                return Ok(());
            }

            let wait_timeout = if nb_msgs == 0 { first_timeout } else { normal_timeout };
            signal.wait(wait_timeout).await;

            self.writer.respond_ack(&self.ack).await?;

            if let Some(e) = signal.error_code() {
                return Err(e);
            }

            let current = signal.msg_num();
            if current <= nb_msgs {
                warn!(
                    session_id = self.session_id,
                    timeout_ms = wait_timeout.as_millis() as u64,
                    nb_msgs,
                    "publish timeout, publisher gone"
                );
                return Err(Error::SocketTimeout);
            }
            nb_msgs = current;
        }
    }

    /// Answer the FCUnpublish that ended a FMLE session.
    async fn fmle_unpublish(&mut self, transaction_id: f64) -> Result<()> {
        self.writer
            .send_packet(
                &Packet::OnStatusCall(OnStatusCallPacket::on_fc_unpublish(
                    "Stopped publishing stream.",
                )),
                0,
            )
            .await?;
        self.writer
            .send_packet(&Packet::FmleStartRes(FmleStartResPacket::new(transaction_id)), 0)
            .await?;
        self.writer
            .send_packet(
                &Packet::OnStatusCall(OnStatusCallPacket::status(
                    NS_UNPUBLISH_SUCCESS,
                    "Stopped publishing stream.",
                )),
                RESPONSE_STREAM_ID,
            )
            .await
    }

    /// Player terminal state.
    async fn playing(&mut self, source: &Arc<Source>) -> Result<()> {
        let consumer = source.create_consumer(true, true, true);
        *self.flags.wakeable.lock().expect("wakeable slot") = Some(Arc::clone(&consumer));

        let reader = self.reader.take().expect("reader present");
        let mut thread = QueueRecvThread::spawn(reader);

        let result = self.do_playing(&consumer, &mut thread).await;

        thread.stop();
        *self.flags.wakeable.lock().expect("wakeable slot") = None;
        result
    }

    async fn do_playing(
        &mut self,
        consumer: &Arc<Consumer>,
        thread: &mut QueueRecvThread,
    ) -> Result<()> {
        loop {
            if self.expired() {
                return Err(Error::UserDisconnect);
            }
            if self.disposed() {
                return Ok(());
            }

            while let Some(msg) = thread.pump() {
                if !self.handle_play_message(consumer, &msg).await? {
                    return Ok(());
                }
            }

            if let Some(e) = thread.error_code() {
                return Err(e);
            }

            consumer.wait(MW_MIN_MSGS, self.vhost.mw_sleep).await;

            self.writer.respond_ack(&self.ack).await?;

            let msgs = consumer.dump_packets(MW_MSGS);
            if msgs.is_empty() {
                continue;
            }

            // a player that stops reading must not wedge the whole batch
            timeout(
                RTMP_SEND_TIMEOUT,
                self.writer.send_messages(&msgs, RESPONSE_STREAM_ID),
            )
            .await
            .map_err(|_| Error::SocketTimeout)??;
        }
    }

    /// Control messages arriving from a playing client. Returns false when
    /// the client asked to stop.
    async fn handle_play_message(
        &mut self,
        consumer: &Arc<Consumer>,
        msg: &RtmpMessage,
    ) -> Result<bool> {
        if !msg.header.is_amf0_command()
            && !msg.header.is_amf3_command()
            && !msg.header.is_user_control()
        {
            return Ok(true);
        }

        match Packet::decode(msg, &self.transactions)? {
            Packet::Pause(p) => {
                consumer.on_play_client_pause(p.is_pause);
                let (code, description) = if p.is_pause {
                    (NS_PAUSE_NOTIFY, "Paused stream.")
                } else {
                    (NS_UNPAUSE_NOTIFY, "Unpaused stream.")
                };
                self.writer
                    .send_packet(
                        &Packet::OnStatusCall(OnStatusCallPacket::status(code, description)),
                        RESPONSE_STREAM_ID,
                    )
                    .await?;
            }
            Packet::CloseStream(_) => {
                debug!(session_id = self.session_id, "play client closed the stream");
                return Ok(false);
            }
            Packet::UserControl(p) => {
                if let UserControlEvent::PingRequest(ts) = p.event {
                    self.writer
                        .send_packet(
                            &Packet::UserControl(UserControlPacket::ping_response(ts)),
                            0,
                        )
                        .await?;
                }
            }
            _ => {}
        }
        Ok(true)
    }

    /// Receive one message, answering acks and pings on the way.
    async fn recv_interleaved(&mut self) -> Result<RtmpMessage> {
        let reader = self.reader.as_mut().expect("reader present");
        let msg = timeout(RTMP_RECV_TIMEOUT, reader.recv_message())
            .await
            .map_err(|_| Error::SocketTimeout)??;

        self.writer.respond_ack(&self.ack).await?;

        if msg.header.is_user_control() {
            if let Packet::UserControl(p) = Packet::decode(&msg, &self.transactions)? {
                if let UserControlEvent::PingRequest(ts) = p.event {
                    self.writer
                        .send_packet(
                            &Packet::UserControl(UserControlPacket::ping_response(ts)),
                            0,
                        )
                        .await?;
                }
            }
        }

        Ok(msg)
    }

    /// Receive until `select` accepts a decoded command packet.
    async fn expect<T>(&mut self, mut select: impl FnMut(Packet) -> Option<T>) -> Result<T> {
        loop {
            let msg = self.recv_interleaved().await?;
            if !msg.header.is_amf0_command() && !msg.header.is_amf3_command() {
                continue;
            }
            if let Some(value) = select(Packet::decode(&msg, &self.transactions)?) {
                return Ok(value);
            }
        }
    }
}

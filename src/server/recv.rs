//! Auxiliary receive tasks
//!
//! Both publish and play run a second task that drains the socket while the
//! main connection task paces its own loop. On the play side the task only
//! queues control messages; on the publish side it feeds every message
//! straight into the source and bumps a counter the main loop watches for
//! liveness.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::constants::QUEUE_RECV_CAPACITY;
use crate::protocol::message::RtmpMessage;
use crate::protocol::packet::{Packet, Transactions};
use crate::protocol::stack::MessageReader;
use crate::session::source::Source;

/// Playing-side receive task: drains control messages into a bounded FIFO
pub struct QueueRecvThread {
    rx: mpsc::Receiver<RtmpMessage>,
    error: Arc<Mutex<Option<Error>>>,
    handle: JoinHandle<()>,
}

impl QueueRecvThread {
    /// Spawn the drain task; it parks whenever the FIFO is full.
    pub fn spawn<R>(mut reader: MessageReader<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(QUEUE_RECV_CAPACITY);
        let error = Arc::new(Mutex::new(None));
        let error_slot = Arc::clone(&error);

        let handle = tokio::spawn(async move {
            loop {
                match reader.recv_message().await {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        if !e.is_gracefully_closed() {
                            debug!(error = %e, "play recv thread failed");
                        }
                        *error_slot.lock().expect("recv error slot") = Some(e);
                        break;
                    }
                }
            }
        });

        Self { rx, error, handle }
    }

    /// Pop one queued message, if any
    pub fn pump(&mut self) -> Option<RtmpMessage> {
        match self.rx.try_recv() {
            Ok(msg) => Some(msg),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Take the task's exit error, once
    pub fn error_code(&self) -> Option<Error> {
        self.error.lock().expect("recv error slot").take()
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

/// Shared state between the publishing loop and its receive task
#[derive(Default)]
pub struct PublishSignal {
    /// Messages processed so far; the main loop samples this across waits
    msg_num: AtomicU64,
    notify: Notify,
    error: Mutex<Option<Error>>,
    /// FCUnpublish transaction id, for the goodbye _result
    unpublish_tid: Mutex<Option<f64>>,
    can_run: AtomicBool,
}

impl PublishSignal {
    pub fn msg_num(&self) -> u64 {
        self.msg_num.load(Ordering::Acquire)
    }

    /// Park until the recv task signals progress, or the timeout passes
    pub async fn wait(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }

    pub fn error_code(&self) -> Option<Error> {
        self.error.lock().expect("publish error slot").take()
    }

    pub fn unpublish_transaction_id(&self) -> Option<f64> {
        *self.unpublish_tid.lock().expect("unpublish tid slot")
    }

    fn fail(&self, error: Error) {
        *self.error.lock().expect("publish error slot") = Some(error);
        self.notify.notify_one();
    }
}

/// Publishing-side receive task: feeds the source, counts messages
pub struct PublishRecvThread<R> {
    signal: Arc<PublishSignal>,
    handle: JoinHandle<MessageReader<R>>,
}

impl<R> PublishRecvThread<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn spawn(
        mut reader: MessageReader<R>,
        source: Arc<Source>,
        transactions: Arc<Transactions>,
        is_fmle: bool,
    ) -> Self {
        let signal = Arc::new(PublishSignal::default());
        signal.can_run.store(true, Ordering::Release);
        let shared = Arc::clone(&signal);

        let handle = tokio::spawn(async move {
            while shared.can_run.load(Ordering::Acquire) {
                let msg = match reader.recv_message().await {
                    Ok(msg) => msg,
                    Err(e) => {
                        if !e.is_gracefully_closed() {
                            debug!(error = %e, "publish recv thread failed");
                        }
                        shared.fail(e);
                        break;
                    }
                };

                if let Err(e) = process_publish_message(&source, &msg, is_fmle, &transactions, &shared)
                {
                    shared.fail(e);
                    break;
                }

                shared.msg_num.fetch_add(1, Ordering::Release);
                shared.notify.notify_one();
            }
            reader
        });

        Self { signal, handle }
    }

    pub fn signal(&self) -> Arc<PublishSignal> {
        Arc::clone(&self.signal)
    }

    /// Stop the task. Returns the reader when the task had already finished
    /// on its own (the republish path re-identifies on the same socket).
    pub async fn stop(self) -> Option<MessageReader<R>> {
        self.signal.can_run.store(false, Ordering::Release);
        self.handle.abort();
        self.handle.await.ok()
    }
}

/// Classify one received message and hand it to the source.
fn process_publish_message(
    source: &Arc<Source>,
    msg: &RtmpMessage,
    is_fmle: bool,
    transactions: &Transactions,
    signal: &PublishSignal,
) -> Result<()> {
    let header = &msg.header;

    if header.is_audio() {
        source.on_audio(msg.clone());
        return Ok(());
    }
    if header.is_video() {
        source.on_video(msg.clone());
        return Ok(());
    }

    if header.is_amf0_command() || header.is_amf3_command() {
        let packet = Packet::decode(msg, transactions)?;

        if !is_fmle {
            // a flash publisher re-issuing commands restarts its session
            debug!("refresh flash publish session");
            return Err(Error::ControlRepublish);
        }

        if let Packet::FmleStart(p) = packet {
            if p.is_unpublish() {
                *signal.unpublish_tid.lock().expect("unpublish tid slot") =
                    Some(p.transaction_id);
                return Err(Error::ControlRepublish);
            }
        }
        return Ok(());
    }

    if header.is_amf0_data() || header.is_amf3_data() {
        if let Packet::OnMetadata(p) = Packet::decode(msg, transactions)? {
            source.on_metadata(&p)?;
        }
        return Ok(());
    }

    Ok(())
}

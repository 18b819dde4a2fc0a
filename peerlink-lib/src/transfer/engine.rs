//! File send/receive orchestration with flow control.
//!
//! Exactly one file is in flight per session. The active send runs in a
//! spawned pump that reads the file in fixed-size slices, frames each slice
//! with the chunk codec, and pauses whenever the channel's outstanding
//! buffered bytes sit at or above the high watermark, so a slow receiver
//! never inflates sender memory or starves control traffic. Every state
//! mutation happens on the session actor when the pump's events arrive.

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use tokio::{
    fs,
    io::AsyncReadExt,
    sync::{mpsc, watch},
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::session::channel::TransferChannel;
use crate::session::{Internal, SessionConfig};
use crate::transfer::codec::{self, ControlMessage};
use crate::transfer::{
    generate_file_id, FileMetadata, ReceivedFile, TransferDirection, TransferProgress,
    TransferRecord, TransferStatus,
};
use crate::transport::DataChannel;

pub(crate) enum PumpEvent {
    Progress { file_id: String, bytes: u64 },
    Finished { file_id: String },
    Failed { file_id: String, error: String },
}

struct QueuedFile {
    path: PathBuf,
    metadata: FileMetadata,
}

struct ActiveSend {
    file_id: String,
    cancel: watch::Sender<bool>,
}

pub(crate) struct TransferEngine {
    records: HashMap<String, TransferRecord>,
    queue: VecDeque<QueuedFile>,
    active: Option<ActiveSend>,
    reassembly: HashMap<String, Vec<Bytes>>,
    progress_tx: mpsc::UnboundedSender<TransferProgress>,
    received_tx: mpsc::UnboundedSender<ReceivedFile>,
}

impl TransferEngine {
    pub fn new(
        progress_tx: mpsc::UnboundedSender<TransferProgress>,
        received_tx: mpsc::UnboundedSender<ReceivedFile>,
    ) -> Self {
        Self {
            records: HashMap::new(),
            queue: VecDeque::new(),
            active: None,
            reassembly: HashMap::new(),
            progress_tx,
            received_tx,
        }
    }

    /// Size policy is enforced here, before anything is queued; `false`
    /// means rejected with no partial attempt.
    pub fn queue_file(&mut self, path: PathBuf, metadata: FileMetadata, max_size: u64) -> bool {
        if metadata.size > max_size {
            warn!(
                name = %metadata.name,
                size = metadata.size,
                max = max_size,
                "file rejected by size policy"
            );
            return false;
        }
        self.queue.push_back(QueuedFile { path, metadata });
        true
    }

    /// Start the next queued file if the channel is ready and nothing is in
    /// flight. A file whose announcement fails is marked failed and the
    /// queue advances.
    pub async fn start_next(
        &mut self,
        channel: &TransferChannel,
        config: &SessionConfig,
        round: u64,
        internal_tx: &mpsc::UnboundedSender<Internal>,
    ) {
        while self.active.is_none() && channel.is_ready() {
            let Some(next) = self.queue.pop_front() else {
                return;
            };
            let file_id = generate_file_id();
            self.records.insert(
                file_id.clone(),
                TransferRecord::new(next.metadata.clone(), TransferDirection::Sending),
            );
            self.emit(&file_id);

            let start = ControlMessage::FileStart {
                file_id: file_id.clone(),
                metadata: next.metadata.clone(),
            };
            match channel.send_control(&start).await {
                Ok(()) => {
                    if let Some(record) = self.records.get_mut(&file_id) {
                        record.status = TransferStatus::Transferring;
                    }
                    info!(
                        %file_id,
                        name = %next.metadata.name,
                        size = next.metadata.size,
                        "file send started"
                    );
                    self.emit(&file_id);
                    let Some(handle) = channel.handle() else {
                        self.fail_record(&file_id, "channel went away");
                        continue;
                    };
                    let (cancel_tx, cancel_rx) = watch::channel(false);
                    spawn_send_pump(PumpContext {
                        round,
                        file_id: file_id.clone(),
                        path: next.path,
                        channel: handle,
                        chunk_size: config.chunk_size,
                        high_watermark: config.buffer_high_watermark,
                        drain_poll: config.drain_poll,
                        internal_tx: internal_tx.clone(),
                        cancel: cancel_rx,
                    });
                    self.active = Some(ActiveSend {
                        file_id,
                        cancel: cancel_tx,
                    });
                }
                Err(e) => self.fail_record(&file_id, &e.to_string()),
            }
        }
    }

    /// Returns true when the queue may advance (the active send ended).
    pub fn on_pump_event(&mut self, event: PumpEvent) -> bool {
        match event {
            PumpEvent::Progress { file_id, bytes } => {
                if self.active.as_ref().map(|a| &a.file_id) != Some(&file_id) {
                    return false;
                }
                if let Some(record) = self.records.get_mut(&file_id) {
                    record.transferred =
                        (record.transferred.saturating_add(bytes)).min(record.metadata.size);
                    self.emit(&file_id);
                }
                false
            }
            PumpEvent::Finished { file_id } => {
                if self.active.as_ref().map(|a| &a.file_id) != Some(&file_id) {
                    return false;
                }
                self.active = None;
                if let Some(record) = self.records.get_mut(&file_id) {
                    record.transferred = record.metadata.size;
                    record.status = TransferStatus::Completed;
                    info!(%file_id, "file send complete");
                    self.emit(&file_id);
                }
                true
            }
            PumpEvent::Failed { file_id, error } => {
                let was_active = self.active.as_ref().map(|a| &a.file_id) == Some(&file_id);
                if was_active {
                    self.active = None;
                }
                self.fail_record(&file_id, &error);
                was_active
            }
        }
    }

    pub fn on_control(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::FileStart { file_id, metadata } => {
                if self.records.contains_key(&file_id) {
                    warn!(%file_id, "duplicate file-start, restarting transfer");
                }
                let mut record = TransferRecord::new(metadata, TransferDirection::Receiving);
                record.status = TransferStatus::Transferring;
                debug!(
                    %file_id,
                    name = %record.metadata.name,
                    size = record.metadata.size,
                    "incoming file"
                );
                self.records.insert(file_id.clone(), record);
                self.reassembly.insert(file_id.clone(), Vec::new());
                self.emit(&file_id);
            }
            ControlMessage::FileEnd { file_id } => self.finish_receive(&file_id),
        }
    }

    /// Append a received chunk; concatenation order is arrival order, which
    /// the channel guarantees to match send order.
    pub fn on_chunk(&mut self, file_id: &str, payload: Bytes) {
        let Some(chunks) = self.reassembly.get_mut(file_id) else {
            debug!(%file_id, "chunk for unknown transfer dropped");
            return;
        };
        let len = payload.len() as u64;
        chunks.push(payload);
        if let Some(record) = self.records.get_mut(file_id) {
            record.transferred = (record.transferred.saturating_add(len)).min(record.metadata.size);
            self.emit(file_id);
        }
    }

    fn finish_receive(&mut self, file_id: &str) {
        let Some(chunks) = self.reassembly.remove(file_id) else {
            debug!(%file_id, "file-end for unknown transfer ignored");
            return;
        };
        let Some(mut record) = self.records.remove(file_id) else {
            debug!(%file_id, "file-end without a record ignored");
            return;
        };
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        let mut data = BytesMut::with_capacity(total);
        for chunk in &chunks {
            data.extend_from_slice(chunk);
        }
        record.status = TransferStatus::Completed;
        info!(%file_id, bytes = total, name = %record.metadata.name, "file reassembled");
        let _ = self.progress_tx.send(record.progress(file_id));
        let _ = self.received_tx.send(ReceivedFile {
            file_id: file_id.to_owned(),
            metadata: record.metadata,
            data: data.freeze(),
        });
    }

    /// Cancel the in-flight send, if any, and mark its record failed.
    pub fn fail_active(&mut self, reason: &str) {
        if let Some(active) = self.active.take() {
            let _ = active.cancel.send(true);
            self.fail_record(&active.file_id, reason);
        }
    }

    /// Session teardown: clear the queue and the reassembly map, cancel the
    /// pump, fail everything still in flight.
    pub fn abort_all(&mut self) {
        self.fail_active("session teardown");
        self.queue.clear();
        let open: Vec<String> = self
            .records
            .iter()
            .filter(|(_, r)| {
                matches!(
                    r.status,
                    TransferStatus::Pending | TransferStatus::Transferring
                )
            })
            .map(|(id, _)| id.clone())
            .collect();
        for file_id in open {
            self.fail_record(&file_id, "session teardown");
        }
        self.reassembly.clear();
    }

    fn fail_record(&mut self, file_id: &str, reason: &str) {
        if let Some(record) = self.records.get_mut(file_id) {
            if !matches!(
                record.status,
                TransferStatus::Completed | TransferStatus::Failed
            ) {
                record.status = TransferStatus::Failed;
                warn!(
                    error = %Error::Transfer(reason.to_owned()),
                    %file_id,
                    "transfer failed"
                );
                self.emit(file_id);
            }
        }
    }

    fn emit(&self, file_id: &str) {
        if let Some(record) = self.records.get(file_id) {
            let _ = self.progress_tx.send(record.progress(file_id));
        }
    }
}

struct PumpContext {
    round: u64,
    file_id: String,
    path: PathBuf,
    channel: Arc<dyn DataChannel>,
    chunk_size: usize,
    high_watermark: usize,
    drain_poll: Duration,
    internal_tx: mpsc::UnboundedSender<Internal>,
    cancel: watch::Receiver<bool>,
}

fn spawn_send_pump(ctx: PumpContext) {
    tokio::spawn(async move {
        let round = ctx.round;
        let file_id = ctx.file_id.clone();
        let internal_tx = ctx.internal_tx.clone();
        match pump_file(ctx).await {
            Ok(true) => {
                let _ = internal_tx.send(Internal::Pump {
                    round,
                    event: PumpEvent::Finished { file_id },
                });
            }
            // Cancelled mid-read or mid-wait: the session is gone, a stale
            // completion must stay a no-op.
            Ok(false) => {}
            Err(e) => {
                let _ = internal_tx.send(Internal::Pump {
                    round,
                    event: PumpEvent::Failed {
                        file_id,
                        error: e.to_string(),
                    },
                });
            }
        }
    });
}

async fn pump_file(ctx: PumpContext) -> anyhow::Result<bool> {
    let mut file = fs::File::open(&ctx.path).await?;
    let mut buf = vec![0u8; ctx.chunk_size];
    loop {
        if *ctx.cancel.borrow() {
            return Ok(false);
        }
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        // advance by the bytes actually read; short reads near EOF are fine
        let frame = codec::encode_chunk(&ctx.file_id, &buf[..n])?;
        while ctx.channel.buffered_amount().await >= ctx.high_watermark {
            if *ctx.cancel.borrow() {
                return Ok(false);
            }
            sleep(ctx.drain_poll).await;
        }
        if *ctx.cancel.borrow() {
            return Ok(false);
        }
        ctx.channel.send(frame).await?;
        let _ = ctx.internal_tx.send(Internal::Pump {
            round: ctx.round,
            event: PumpEvent::Progress {
                file_id: ctx.file_id.clone(),
                bytes: n as u64,
            },
        });
    }
    let end = codec::encode_control(&ControlMessage::FileEnd {
        file_id: ctx.file_id.clone(),
    })?;
    ctx.channel.send_text(&end).await?;
    Ok(true)
}

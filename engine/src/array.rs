// Copyright 2026 Oxide Computer Company
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use slog::{info, o, Logger};
use tokio::sync::{mpsc, oneshot};

use crate::bitmap::WriteIntentBitmap;
use crate::disk::DiskEndpoint;
use crate::dispatch::{Dispatcher, IoCompletion};
use crate::engine::RaidEngine;
use crate::recovery::{ProgressStore, RecoveryDriver, RepairMode};
use crate::request::{RequestDir, RequestRes, RequestWaiter};
use crate::stats::ArrayStats;
use palisade_common::{
    bytes_to_sectors, raid_bail, Algorithm, ArrayDefinition, RaidError,
    SECTOR_SIZE,
};

/// Depth of the request channel into the engine task.
const REQUEST_CHANNEL_DEPTH: usize = 512;

#[derive(Debug)]
enum ArrayRequest {
    Read {
        start: u64,
        sectors: u64,
        res: RequestRes,
    },
    Write {
        start: u64,
        data: Bytes,
        res: RequestRes,
    },
    StartResync {
        mode: RepairMode,
        done: oneshot::Sender<Result<(), RaidError>>,
    },
    StartReshape {
        added: Vec<Arc<dyn DiskEndpoint>>,
        chunk_sectors: u64,
        algorithm: Algorithm,
        done: oneshot::Sender<Result<(), RaidError>>,
    },
    FailDisk {
        disk: usize,
    },
    Query {
        done: oneshot::Sender<ArrayStatus>,
    },
    Stop,
}

/// Point-in-time view of the array, returned by [`Array::status`].
#[derive(Debug, Clone, Serialize)]
pub struct ArrayStatus {
    pub stats: ArrayStats,
    pub disks: usize,
    pub failed_disks: usize,
    pub capacity_sectors: u64,
    pub reshape_position: Option<u64>,
    pub recovery_idle: bool,
    pub recovery_stalled: bool,
}

/**
 * Handle to a running array.  Cheap to clone; all calls funnel into the
 * single engine task, which owns every stripe.  Dropping the last
 * handle (or calling [`Array::stop`]) shuts the engine down.
 */
#[derive(Clone, Debug)]
pub struct Array {
    tx: mpsc::Sender<ArrayRequest>,
}

impl Array {
    /**
     * Assemble and start an array.  `disks` must match the definition's
     * member count; a `None` member starts the array degraded.  The
     * progress store, when given, persists recovery checkpoints and is
     * consulted at startup to resume an interrupted reshape.
     */
    pub fn new(
        def: ArrayDefinition,
        disks: Vec<Option<Arc<dyn DiskEndpoint>>>,
        bitmap: Arc<dyn WriteIntentBitmap>,
        store: Option<Box<dyn ProgressStore>>,
        cache_stripes: usize,
        log: Logger,
    ) -> Result<Array, RaidError> {
        let (io_tx, io_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(io_tx, &log);
        let recovery =
            RecoveryDriver::new(store, log.new(o!("task" => "recovery")));
        let mut engine = RaidEngine::new(
            def,
            disks,
            bitmap,
            recovery,
            cache_stripes,
            dispatcher,
            log.new(o!("task" => "engine")),
        )?;
        engine.resume_recovery();
        info!(log, "array engine started");

        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_DEPTH);
        tokio::spawn(async move {
            ArrayActor { engine, rx, io_rx }.run().await;
        });
        Ok(Array { tx })
    }

    /// Submit a read of `sectors` sectors at logical sector `start`,
    /// returning a waiter for the assembled data.
    pub async fn submit_read(
        &self,
        start: u64,
        sectors: u64,
    ) -> Result<RequestWaiter, RaidError> {
        let (res, waiter) = RequestRes::pair();
        self.tx
            .send(ArrayRequest::Read { start, sectors, res })
            .await
            .map_err(|_| RaidError::ShuttingDown)?;
        Ok(waiter)
    }

    /// Submit a write of whole sectors at logical sector `start`.
    pub async fn submit_write(
        &self,
        start: u64,
        data: Bytes,
    ) -> Result<RequestWaiter, RaidError> {
        if data.is_empty() || data.len() % SECTOR_SIZE != 0 {
            raid_bail!(LengthUnaligned);
        }
        let (res, waiter) = RequestRes::pair();
        self.tx
            .send(ArrayRequest::Write { start, data, res })
            .await
            .map_err(|_| RaidError::ShuttingDown)?;
        Ok(waiter)
    }

    pub async fn read(
        &self,
        start: u64,
        sectors: u64,
    ) -> Result<BytesMut, RaidError> {
        let waiter = self.submit_read(start, sectors).await?;
        match waiter.wait().await? {
            Some(buf) => Ok(buf),
            None => Err(RaidError::GenericError(
                "read completed without data".to_string(),
            )),
        }
    }

    pub async fn write(
        &self,
        start: u64,
        data: Bytes,
    ) -> Result<(), RaidError> {
        let waiter = self.submit_write(start, data).await?;
        waiter.wait().await?;
        Ok(())
    }

    pub async fn start_resync(
        &self,
        mode: RepairMode,
    ) -> Result<(), RaidError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(ArrayRequest::StartResync { mode, done })
            .await
            .map_err(|_| RaidError::ShuttingDown)?;
        rx.await.map_err(|_| RaidError::RecvDisconnected)?
    }

    pub async fn start_reshape(
        &self,
        added: Vec<Arc<dyn DiskEndpoint>>,
        chunk_sectors: u64,
        algorithm: Algorithm,
    ) -> Result<(), RaidError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(ArrayRequest::StartReshape {
                added,
                chunk_sectors,
                algorithm,
                done,
            })
            .await
            .map_err(|_| RaidError::ShuttingDown)?;
        rx.await.map_err(|_| RaidError::RecvDisconnected)?
    }

    /// Administratively eject a member disk.
    pub async fn fail_disk(&self, disk: usize) -> Result<(), RaidError> {
        self.tx
            .send(ArrayRequest::FailDisk { disk })
            .await
            .map_err(|_| RaidError::ShuttingDown)
    }

    pub async fn status(&self) -> Result<ArrayStatus, RaidError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(ArrayRequest::Query { done })
            .await
            .map_err(|_| RaidError::ShuttingDown)?;
        rx.await.map_err(|_| RaidError::RecvDisconnected)
    }

    /// Block until no background recovery operation is running.
    pub async fn wait_recovery_idle(&self) -> Result<ArrayStatus, RaidError> {
        loop {
            let status = self.status().await?;
            if status.recovery_idle || status.recovery_stalled {
                return Ok(status);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    pub async fn stop(&self) {
        let _ = self.tx.send(ArrayRequest::Stop).await;
    }
}

struct ArrayActor {
    engine: RaidEngine,
    rx: mpsc::Receiver<ArrayRequest>,
    io_rx: mpsc::UnboundedReceiver<IoCompletion>,
}

enum Action {
    Request(Option<ArrayRequest>),
    Io(IoCompletion),
    Tick,
}

impl ArrayActor {
    /**
     * The engine loop: one action in, then evaluate everything it made
     * runnable.  Completions take priority over new requests so the
     * cache drains under pressure instead of filling further.  A timer
     * keeps recovery moving through steps no event announces (pool
     * pressure retries, quiesce completion).
     */
    async fn run(mut self) {
        loop {
            let recovery_running = !self.engine.recovery.is_idle()
                && !self.engine.recovery.is_stalled();
            let action = tokio::select! {
                biased;
                Some(c) = self.io_rx.recv() => Action::Io(c),
                r = self.rx.recv() => Action::Request(r),
                _ = tokio::time::sleep(Duration::from_millis(1)),
                    if recovery_running => Action::Tick,
            };

            match action {
                Action::Request(None) | Action::Request(Some(
                    ArrayRequest::Stop,
                )) => break,
                Action::Request(Some(req)) => self.handle_request(req),
                Action::Io(c) => self.engine.on_io_complete(c),
                Action::Tick => {}
            }

            self.engine.flush_pending_work();
            self.engine.recovery_tick();
            self.engine.flush_pending_work();
            self.engine.retry_waiting();
            self.engine.flush_pending_work();
        }
        self.engine.bitmap.flush_pending();
        info!(self.engine.log, "array engine stopping");
    }

    fn handle_request(&mut self, req: ArrayRequest) {
        match req {
            ArrayRequest::Read { start, sectors, res } => {
                self.engine
                    .submit_io(RequestDir::Read, start, sectors, None, res);
            }
            ArrayRequest::Write { start, data, res } => {
                let sectors = bytes_to_sectors(data.len());
                self.engine.submit_io(
                    RequestDir::Write,
                    start,
                    sectors,
                    Some(data),
                    res,
                );
            }
            ArrayRequest::StartResync { mode, done } => {
                let _ = done.send(self.engine.start_resync(mode));
            }
            ArrayRequest::StartReshape {
                added,
                chunk_sectors,
                algorithm,
                done,
            } => {
                let _ = done.send(self.engine.start_reshape(
                    added,
                    chunk_sectors,
                    algorithm,
                ));
            }
            ArrayRequest::FailDisk { disk } => {
                self.engine.fail_disk(disk);
            }
            ArrayRequest::Query { done } => {
                let cfg = &self.engine.cfg;
                let _ = done.send(ArrayStatus {
                    stats: self.engine.stats,
                    disks: self.engine.disks.len(),
                    failed_disks: self.engine.failed_disks(),
                    capacity_sectors: cfg.capacity_sectors(),
                    reshape_position: cfg.reshape_position(),
                    recovery_idle: self.engine.recovery.is_idle(),
                    recovery_stalled: self.engine.recovery.is_stalled(),
                });
            }
            ArrayRequest::Stop => unreachable!("handled by the run loop"),
        }
    }
}

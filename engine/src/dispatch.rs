// Copyright 2026 Oxide Computer Company
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use slog::{o, Logger};
use tokio::sync::mpsc;

use crate::disk::DiskEndpoint;
use palisade_common::{RaidError, PAGE_SIZE};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum IoDir {
    Read,
    Write,
}

/**
 * One finished device transfer, routed back into the engine task.  The
 * stripe is named by (sector, epoch) rather than by handle: the index
 * lookup on arrival naturally discards completions for rows the cache
 * has since recycled.
 */
#[derive(Debug)]
pub(crate) struct IoCompletion {
    pub stripe_sector: u64,
    pub epoch: u8,
    pub slot: usize,
    pub disk: usize,
    pub dir: IoDir,
    pub result: Result<Option<BytesMut>, RaidError>,
}

/**
 * Fans page transfers out to member disks.  Each transfer runs on its
 * own spawned task and re-enters the engine through the completion
 * channel, so the engine task itself never blocks on a device.
 */
#[derive(Debug)]
pub(crate) struct Dispatcher {
    tx: mpsc::UnboundedSender<IoCompletion>,
    log: Logger,
}

impl Dispatcher {
    pub fn new(
        tx: mpsc::UnboundedSender<IoCompletion>,
        log: &Logger,
    ) -> Dispatcher {
        Dispatcher {
            tx,
            log: log.new(o!("task" => "dispatch")),
        }
    }

    pub fn submit_read(
        &self,
        disk: usize,
        endpoint: Arc<dyn DiskEndpoint>,
        stripe_sector: u64,
        epoch: u8,
        slot: usize,
    ) {
        let tx = self.tx.clone();
        let log = self.log.clone();
        tokio::spawn(async move {
            let mut buf = BytesMut::zeroed(PAGE_SIZE);
            let result = endpoint
                .read(stripe_sector, &mut buf)
                .await
                .map(|_| Some(buf));
            if let Err(e) = &result {
                slog::warn!(
                    log,
                    "read failed on disk {} sector {}: {}",
                    disk,
                    stripe_sector,
                    e
                );
            }
            // The engine dropping its receiver means shutdown; nothing
            // left to tell.
            let _ = tx.send(IoCompletion {
                stripe_sector,
                epoch,
                slot,
                disk,
                dir: IoDir::Read,
                result,
            });
        });
    }

    pub fn submit_write(
        &self,
        disk: usize,
        endpoint: Arc<dyn DiskEndpoint>,
        stripe_sector: u64,
        epoch: u8,
        slot: usize,
        data: Bytes,
    ) {
        let tx = self.tx.clone();
        let log = self.log.clone();
        tokio::spawn(async move {
            let result =
                endpoint.write(stripe_sector, &data).await.map(|_| None);
            if let Err(e) = &result {
                slog::warn!(
                    log,
                    "write failed on disk {} sector {}: {}",
                    disk,
                    stripe_sector,
                    e
                );
            }
            let _ = tx.send(IoCompletion {
                stripe_sector,
                epoch,
                slot,
                disk,
                dir: IoDir::Write,
                result,
            });
        });
    }
}

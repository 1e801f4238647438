// Copyright 2026 Oxide Computer Company
use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use ringbuffer::{AllocRingBuffer, RingBuffer};
use tokio::sync::oneshot;

use crate::RequestId;
use palisade_common::RaidError;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum RequestDir {
    Read,
    Write,
}

/// A read resolves to the assembled buffer; a write to nothing.
pub type RequestResult = Result<Option<BytesMut>, RaidError>;

/**
 * The sending half of one caller request.  The engine holds this until
 * every fragment of the request has been satisfied, then consumes it to
 * deliver exactly one result.
 */
#[derive(Debug)]
pub(crate) struct RequestRes {
    tx: oneshot::Sender<RequestResult>,
}

impl RequestRes {
    pub fn pair() -> (RequestRes, RequestWaiter) {
        let (tx, rx) = oneshot::channel();
        (RequestRes { tx }, RequestWaiter { rx })
    }

    pub fn send_result(self, result: RequestResult) {
        // A caller that dropped its waiter gets no answer; that is
        // their choice, not an engine error.
        let _ = self.tx.send(result);
    }
}

/// The caller's half: awaits the one result for a submitted request.
#[derive(Debug)]
pub struct RequestWaiter {
    rx: oneshot::Receiver<RequestResult>,
}

impl RequestWaiter {
    pub async fn wait(self) -> RequestResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(RaidError::RecvDisconnected),
        }
    }
}

/**
 * One in-flight caller request, split across however many stripe rows
 * its range touches.  `remaining` counts unsatisfied fragments; the
 * result goes out exactly once, when it reaches zero.  The first
 * fragment error wins; later fragments still run to completion but
 * cannot overwrite it.
 */
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub dir: RequestDir,
    remaining: usize,
    data: Option<BytesMut>,
    res: Option<RequestRes>,
    error: Option<RaidError>,
}

/// All in-flight caller requests, by id.
#[derive(Debug)]
pub(crate) struct RequestWork {
    active: HashMap<RequestId, PendingRequest>,
    next_id: u64,
    completed: AllocRingBuffer<RequestId>,
}

impl RequestWork {
    pub fn new() -> RequestWork {
        RequestWork {
            active: HashMap::new(),
            next_id: 0,
            completed: AllocRingBuffer::new(2048),
        }
    }

    /// Register a request.  For reads, `data` is the zeroed assembly
    /// buffer fragments copy into; writes carry their payload in the
    /// fragments themselves.
    pub fn submit(
        &mut self,
        dir: RequestDir,
        fragments: usize,
        data: Option<BytesMut>,
        res: RequestRes,
    ) -> RequestId {
        assert!(fragments > 0);
        let id = RequestId(self.next_id);
        self.next_id += 1;
        self.active.insert(
            id,
            PendingRequest {
                dir,
                remaining: fragments,
                data,
                res: Some(res),
                error: None,
            },
        );
        id
    }

    /// Copy satisfied read data into the request's assembly buffer at a
    /// byte offset from the start of the request.
    pub fn write_back(&mut self, id: RequestId, offset: usize, src: &[u8]) {
        let req = self.active.get_mut(&id).unwrap();
        assert_eq!(req.dir, RequestDir::Read);
        let buf = req.data.as_mut().unwrap();
        buf[offset..offset + src.len()].copy_from_slice(src);
    }

    /**
     * One fragment of `id` finished.  When the last one lands, the
     * caller's result is delivered and the request retired.  Returns
     * true if this call completed the request.
     */
    pub fn fragment_done(
        &mut self,
        id: RequestId,
        result: Result<(), RaidError>,
    ) -> bool {
        let req = self.active.get_mut(&id).unwrap();
        assert!(req.remaining > 0);
        req.remaining -= 1;
        if let Err(e) = result {
            if req.error.is_none() {
                req.error = Some(e);
            }
        }
        if req.remaining > 0 {
            return false;
        }

        let mut req = self.active.remove(&id).unwrap();
        self.completed.push(id);
        let res = req.res.take().unwrap();
        match req.error.take() {
            Some(e) => res.send_result(Err(e)),
            None => res.send_result(Ok(req.data.take())),
        }
        true
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

/// A request's slice that falls within a single stripe row page.
#[derive(Debug, Clone)]
pub(crate) struct Fragment {
    pub req: RequestId,
    pub dir: RequestDir,

    /// Global arrival stamp; overlapping work settles in seq order.
    pub seq: u64,

    /// First logical sector of this fragment.
    pub logical: u64,
    pub sectors: u64,

    /// Byte offset of this fragment within the whole request.
    pub req_offset: usize,

    /// Write payload for exactly this fragment; None for reads.
    pub data: Option<Bytes>,
}

#[cfg(test)]
mod test {
    use super::*;
    use palisade_common::sectors_to_bytes;

    #[tokio::test]
    async fn test_single_fragment_read() {
        let mut work = RequestWork::new();
        let (res, waiter) = RequestRes::pair();
        let buf = BytesMut::zeroed(sectors_to_bytes(8));
        let id = work.submit(RequestDir::Read, 1, Some(buf), res);

        work.write_back(id, 0, &[7u8; 512]);
        assert!(work.fragment_done(id, Ok(())));
        assert!(work.is_empty());

        let out = waiter.wait().await.unwrap().unwrap();
        assert_eq!(&out[..512], &[7u8; 512]);
        assert!(out[512..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_multi_fragment_acks_once() {
        let mut work = RequestWork::new();
        let (res, waiter) = RequestRes::pair();
        let id = work.submit(RequestDir::Write, 3, None, res);

        assert!(!work.fragment_done(id, Ok(())));
        assert!(!work.fragment_done(id, Ok(())));
        assert_eq!(work.len(), 1);
        assert!(work.fragment_done(id, Ok(())));
        assert!(work.is_empty());

        assert!(waiter.wait().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_first_error_wins() {
        let mut work = RequestWork::new();
        let (res, waiter) = RequestRes::pair();
        let id = work.submit(RequestDir::Write, 2, None, res);

        work.fragment_done(id, Err(RaidError::Unrecoverable));
        work.fragment_done(id, Err(RaidError::OffsetInvalid));

        assert_eq!(waiter.wait().await, Err(RaidError::Unrecoverable));
    }

    #[tokio::test]
    async fn test_dropped_engine_surfaces_disconnect() {
        let (res, waiter) = RequestRes::pair();
        drop(res);
        assert_eq!(waiter.wait().await, Err(RaidError::RecvDisconnected));
    }
}

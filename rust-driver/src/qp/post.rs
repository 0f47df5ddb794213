//! Posting engine.
//!
//! A new WQE is written in full before the previous WQE is linked to it;
//! the link's size word is written last, after a barrier, so hardware
//! following the chain never sees a half written entry.

use std::sync::atomic::Ordering;

use crate::{
    barrier::wmb,
    constants::{ARBEL_MAX_WQES_PER_SEND_DB, TAVOR_MAX_WQES_PER_RECV_DB},
    cq::CompletionQueue,
    device::SpecialQpKind,
    doorbell::{self, DoorbellMode, RECV_DOORBELL, SEND_DOORBELL},
    error::{HcaError, PostError},
    ring::{RingCtx, WorkQueue},
    table::ObjectTable,
    types::{RecvWr, SendWr},
    wqe::{
        self,
        mlx::MlxHeader,
        next,
        send::{Encoded, SendLimits},
        NextEeNds, NextNdaOp,
    },
};

use super::QueuePair;

type PostResult = std::result::Result<(), PostError>;

/// First WQE of a doorbell batch.
#[derive(Debug, Clone, Copy)]
struct BatchHead {
    ind: u32,
    head: u32,
    wqe: Encoded,
}

/// Returns `true` if `wq` has no room, re-checking under the lock of the
/// CQ it completes to since the poller retires entries under that lock.
fn overflows(
    wq: &WorkQueue,
    ctx: &RingCtx,
    cqn: u32,
    cqs: &ObjectTable<CompletionQueue>,
) -> bool {
    if !wq.is_full(ctx) {
        return false;
    }
    let Some(cq) = cqs.get(cqn) else {
        return true;
    };
    let _guard = cq.lock();
    wq.is_full(ctx)
}

impl QueuePair {
    fn send_limits(&self) -> SendLimits {
        let geo = self.sq.geometry();
        SendLimits {
            transport: self.transport,
            memfree: self.memfree,
            max_gs: geo.max_gs,
            max_inline: self.max_inline,
            wqe_size: geo.wqe_size(),
        }
    }

    fn ring_send_doorbell(&self, batch: &BatchHead, nreq: u32) {
        wmb();
        let words = if self.memfree {
            doorbell::arbel_send(
                nreq,
                batch.head & 0xffff,
                batch.wqe.fence,
                batch.wqe.op,
                self.qpn,
                batch.wqe.size,
            )
        } else {
            doorbell::tavor_send(
                self.sq.wqe_addr(batch.ind),
                batch.wqe.fence,
                batch.wqe.op,
                self.qpn,
                batch.wqe.size,
            )
        };
        self.uar.write64(SEND_DOORBELL, words);
    }

    /// Posts send requests.
    ///
    /// Requests before the failing one stay posted and are announced to
    /// hardware.
    pub(crate) fn post_send(
        &self,
        wrs: &[SendWr],
        cqs: &ObjectTable<CompletionQueue>,
    ) -> PostResult {
        let state = self.state();
        if !state.can_post_send() {
            return Err(PostError::new(0, HcaError::InvalidQpState(state)));
        }
        let lim = self.send_limits();
        let max = self.sq.geometry().max;
        let per_doorbell = if self.memfree {
            ARBEL_MAX_WQES_PER_SEND_DB
        } else {
            self.doorbell_batch
        };

        let mut ctx = self.sq.lock();
        let mut batch: Option<BatchHead> = None;
        let mut nreq = 0u32;
        let mut result = Ok(());

        for (i, wr) in wrs.iter().enumerate() {
            let checked = wqe::send::validate(wr, &lim).and_then(|()| {
                if self.special.is_some() {
                    wqe::mlx::validate(wr)
                } else {
                    Ok(())
                }
            });
            if let Err(err) = checked {
                result = Err(PostError::new(i, err));
                break;
            }
            if overflows(&self.sq, &ctx, self.send_cqn, cqs) {
                result = Err(PostError::new(i, HcaError::Overflow));
                break;
            }

            let ind = ctx.next_ind;
            let slot = self.sq.slot(ind);
            let encoded = match self.special {
                Some(ref sp) => {
                    let hdr = MlxHeader {
                        buf: &sp.header,
                        lkey: self.lkey,
                        is_qp0: sp.kind == SpecialQpKind::Qp0,
                        pkey: sp.pkey,
                        qkey: sp.qkey.load(Ordering::Relaxed),
                        psn: sp.send_psn.fetch_add(1, Ordering::Relaxed),
                    };
                    wqe::mlx::encode(&slot, ind, wr, &hdr, self.sq_sig_all)
                }
                None => wqe::send::encode(&slot, wr, &lim, self.sq_sig_all),
            };
            self.sq.set_wrid(ind, wr.wr_id);

            let prev = self.sq.slot(ctx.last);
            prev.put_be32(
                next::NDA_OP,
                u32::from(NextNdaOp::link(self.sq.wqe_addr(ind), encoded.op)),
            );
            wmb();
            let dbd = self.memfree || nreq == 0;
            prev.put_be32(
                next::EE_NDS,
                u32::from(NextEeNds::with(encoded.size, encoded.fence, dbd)),
            );

            if batch.is_none() {
                batch = Some(BatchHead {
                    ind,
                    head: ctx.head,
                    wqe: encoded,
                });
            }
            ctx.advance(ind, max);
            nreq += 1;

            if let DoorbellMode::MemoryFree(ref rec) = *self.sq.doorbell() {
                wmb();
                rec.set_counter(ctx.head & 0xffff);
            }
            if nreq == per_doorbell {
                if let Some(ref b) = batch {
                    self.ring_send_doorbell(b, nreq);
                }
                batch = None;
                nreq = 0;
            }
        }

        if let Some(ref b) = batch {
            self.ring_send_doorbell(b, nreq);
        }
        result
    }

    /// Posts receive requests to the QP's own receive queue.
    pub(crate) fn post_recv(
        &self,
        wrs: &[RecvWr],
        cqs: &ObjectTable<CompletionQueue>,
    ) -> PostResult {
        if let Some(srqn) = self.srqn {
            return Err(PostError::new(
                0,
                HcaError::InvalidParameter(format!("QP receives from SRQ {srqn:#x}")),
            ));
        }
        let state = self.state();
        if !state.can_post_recv() {
            return Err(PostError::new(0, HcaError::InvalidQpState(state)));
        }
        let geo = *self.rq.geometry();

        let mut ctx = self.rq.lock();
        let mut first: Option<(u32, u8)> = None;
        let mut nreq = 0u32;
        let mut result = Ok(());

        for (i, wr) in wrs.iter().enumerate() {
            if let Err(err) = wqe::recv::validate(&wr.sg_list, geo.max_gs) {
                result = Err(PostError::new(i, err));
                break;
            }
            if overflows(&self.rq, &ctx, self.recv_cqn, cqs) {
                result = Err(PostError::new(i, HcaError::Overflow));
                break;
            }

            let ind = ctx.next_ind;
            let slot = self.rq.slot(ind);
            match *self.rq.doorbell() {
                DoorbellMode::Legacy => {
                    slot.put_be32(
                        next::EE_NDS,
                        u32::from(NextEeNds::with(0, false, true)),
                    );
                    slot.put_be32(next::FLAGS, 0);
                    let size = wqe::recv::put_scatter(&slot, &wr.sg_list, geo.max_gs, false);
                    self.rq.set_wrid(ind, wr.wr_id);

                    // receive rings are prelinked, only the size is published
                    let prev = self.rq.slot(ctx.last);
                    wmb();
                    prev.put_be32(next::EE_NDS, u32::from(NextEeNds::with(size, false, true)));

                    let (first_ind, size0) = *first.get_or_insert((ind, size));
                    ctx.advance(ind, geo.max);
                    nreq += 1;
                    if nreq == TAVOR_MAX_WQES_PER_RECV_DB {
                        wmb();
                        self.uar.write64(
                            RECV_DOORBELL,
                            doorbell::tavor_recv(self.rq.wqe_addr(first_ind), size0, self.qpn, 0),
                        );
                        first = None;
                        nreq = 0;
                    }
                }
                DoorbellMode::MemoryFree(ref rec) => {
                    slot.put_be32(next::FLAGS, 0);
                    let _size = wqe::recv::put_scatter(&slot, &wr.sg_list, geo.max_gs, true);
                    self.rq.set_wrid(ind, wr.wr_id);
                    ctx.advance(ind, geo.max);
                    wmb();
                    rec.set_counter(ctx.head & 0xffff);
                }
            }
        }

        if let Some((first_ind, size0)) = first {
            wmb();
            self.uar.write64(
                RECV_DOORBELL,
                doorbell::tavor_recv(self.rq.wqe_addr(first_ind), size0, self.qpn, nreq),
            );
        }
        result
    }
}

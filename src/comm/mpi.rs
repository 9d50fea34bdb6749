//! MPI transport.
//!
//! Non-blocking operations are recorded when they are started and posted
//! together inside one request scope on the first wait: all receives first,
//! then all sends. Every rank of an exchange posts its complete set of
//! operations before waiting, which is the discipline the decomposition
//! relies on.

use std::cell::RefCell;
use std::collections::HashMap;

use mpi::collective::SystemOperation;
use mpi::topology::Rank;
use mpi::traits::{CommunicatorCollectives, Destination, Source};

use super::{Communicator, ReduceOp, Tag};
use crate::error::CommError;

struct PendingSend {
    dest: usize,
    tag: Tag,
    data: Vec<u8>,
}

struct PendingReceive {
    id: usize,
    source: usize,
    tag: Tag,
    len: usize,
}

#[derive(Default)]
struct Pending {
    next_id: usize,
    sends: Vec<PendingSend>,
    receives: Vec<PendingReceive>,
    completed: HashMap<usize, Vec<u8>>,
}

/// Handle of a send started on an [MpiCommunicator].
#[derive(Debug)]
pub struct MpiSendRequest;

/// Handle of a receive started on an [MpiCommunicator].
#[derive(Debug)]
pub struct MpiRecvRequest {
    id: usize,
}

/// [Communicator] backed by an MPI communicator.
pub struct MpiCommunicator<'c, C: CommunicatorCollectives> {
    comm: &'c C,
    pending: RefCell<Pending>,
}

impl<'c, C: CommunicatorCollectives> MpiCommunicator<'c, C> {
    /// Wrap an MPI communicator.
    pub fn new(comm: &'c C) -> Self {
        Self {
            comm,
            pending: RefCell::new(Pending::default()),
        }
    }

    fn check_rank(&self, rank: usize) -> Result<(), CommError> {
        let size = self.comm.size() as usize;
        if rank < size {
            Ok(())
        } else {
            Err(CommError::InvalidRank { rank, size })
        }
    }

    /// Post and complete all recorded operations.
    fn flush(&self) {
        let mut pending = self.pending.borrow_mut();
        if pending.sends.is_empty() && pending.receives.is_empty() {
            return;
        }

        let sends = std::mem::take(&mut pending.sends);
        let receives = std::mem::take(&mut pending.receives);
        let mut buffers = receives
            .iter()
            .map(|receive| vec![0u8; receive.len])
            .collect::<Vec<_>>();

        mpi::request::scope(|scope| {
            let receive_requests = receives
                .iter()
                .zip(buffers.iter_mut())
                .map(|(receive, buffer)| {
                    self.comm
                        .process_at_rank(receive.source as Rank)
                        .immediate_receive_into_with_tag(scope, &mut buffer[..], receive.tag)
                })
                .collect::<Vec<_>>();

            let send_requests = sends
                .iter()
                .map(|send| {
                    self.comm
                        .process_at_rank(send.dest as Rank)
                        .immediate_send_with_tag(scope, &send.data[..], send.tag)
                })
                .collect::<Vec<_>>();

            for request in receive_requests {
                request.wait();
            }
            for request in send_requests {
                request.wait();
            }
        });

        for (receive, buffer) in receives.iter().zip(buffers) {
            pending.completed.insert(receive.id, buffer);
        }
    }
}

impl<C: CommunicatorCollectives> Communicator for MpiCommunicator<'_, C> {
    type SendRequest = MpiSendRequest;
    type RecvRequest = MpiRecvRequest;

    fn rank(&self) -> usize {
        self.comm.rank() as usize
    }

    fn size(&self) -> usize {
        self.comm.size() as usize
    }

    fn all_reduce_u64(&self, values: &mut [u64], op: ReduceOp) -> Result<(), CommError> {
        let local = values.to_vec();
        match op {
            ReduceOp::Sum => self
                .comm
                .all_reduce_into(&local[..], values, SystemOperation::sum()),
            ReduceOp::Min => self
                .comm
                .all_reduce_into(&local[..], values, SystemOperation::min()),
            ReduceOp::Max => self
                .comm
                .all_reduce_into(&local[..], values, SystemOperation::max()),
        }
        Ok(())
    }

    fn all_reduce_f64(&self, values: &mut [f64], op: ReduceOp) -> Result<(), CommError> {
        let local = values.to_vec();
        match op {
            ReduceOp::Sum => self
                .comm
                .all_reduce_into(&local[..], values, SystemOperation::sum()),
            ReduceOp::Min => self
                .comm
                .all_reduce_into(&local[..], values, SystemOperation::min()),
            ReduceOp::Max => self
                .comm
                .all_reduce_into(&local[..], values, SystemOperation::max()),
        }
        Ok(())
    }

    fn send_async(
        &self,
        dest: usize,
        tag: Tag,
        data: Vec<u8>,
    ) -> Result<MpiSendRequest, CommError> {
        self.check_rank(dest)?;
        self.pending
            .borrow_mut()
            .sends
            .push(PendingSend { dest, tag, data });
        Ok(MpiSendRequest)
    }

    fn recv_async(&self, source: usize, tag: Tag, len: usize) -> Result<MpiRecvRequest, CommError> {
        self.check_rank(source)?;
        let mut pending = self.pending.borrow_mut();
        let id = pending.next_id;
        pending.next_id += 1;
        pending.receives.push(PendingReceive {
            id,
            source,
            tag,
            len,
        });
        Ok(MpiRecvRequest { id })
    }

    fn wait_send(&self, _request: MpiSendRequest) -> Result<(), CommError> {
        self.flush();
        Ok(())
    }

    fn wait_recv(&self, request: MpiRecvRequest) -> Result<Vec<u8>, CommError> {
        self.flush();
        self.pending
            .borrow_mut()
            .completed
            .remove(&request.id)
            .ok_or_else(|| CommError::Transport(format!("unknown receive request {}", request.id)))
    }

    fn abort(&self, code: i32) {
        tracing::error!(rank = self.comm.rank(), code, "aborting MPI run");
        self.comm.abort(code)
    }
}

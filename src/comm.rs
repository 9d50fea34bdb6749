//! Message passing between ranks.
//!
//! The decomposition only needs a small set of operations from the
//! transport: element wise all-reduce of `u64` and `f64` slices and
//! non-blocking point-to-point messages of raw bytes completed by an explicit
//! wait. [Communicator] captures this set. [local::LocalCluster] runs ranks
//! as threads of one process, `mpi::MpiCommunicator` (feature `mpi`) maps it
//! onto MPI.
//!
//! Point-to-point exchanges follow one discipline: every rank posts all
//! receives, then all sends, then waits for every handle.

pub mod local;
#[cfg(feature = "mpi")]
pub mod mpi;

use crate::error::CommError;

/// Message tag.
pub type Tag = i32;

/// Tags of the messages exchanged by the decomposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageTag {
    /// Per peer particle counts.
    Counts = 100,
    /// Particle rows moving to their new owner.
    Redistribute = 101,
    /// Halo particle rows.
    Halos = 102,
}

impl MessageTag {
    /// Numeric value of the tag.
    pub fn tag(self) -> Tag {
        self as Tag
    }
}

/// Reduction operator of an all-reduce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Sum.
    Sum,
    /// Minimum.
    Min,
    /// Maximum.
    Max,
}

impl ReduceOp {
    /// Combine two `u64` values.
    pub fn apply_u64(self, a: u64, b: u64) -> u64 {
        match self {
            ReduceOp::Sum => a.saturating_add(b),
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
        }
    }

    /// Combine two `f64` values.
    pub fn apply_f64(self, a: f64, b: f64) -> f64 {
        match self {
            ReduceOp::Sum => a + b,
            ReduceOp::Min => f64::min(a, b),
            ReduceOp::Max => f64::max(a, b),
        }
    }
}

/// Transport used by the decomposition.
pub trait Communicator {
    /// Handle of a pending send.
    type SendRequest;
    /// Handle of a pending receive.
    type RecvRequest;

    /// Rank of the calling process.
    fn rank(&self) -> usize;

    /// Number of ranks.
    fn size(&self) -> usize;

    /// Element wise all-reduce. On return every rank holds the same values.
    fn all_reduce_u64(&self, values: &mut [u64], op: ReduceOp) -> Result<(), CommError>;

    /// Element wise all-reduce of floating point values.
    ///
    /// The result is bitwise identical on every rank.
    fn all_reduce_f64(&self, values: &mut [f64], op: ReduceOp) -> Result<(), CommError>;

    /// Start sending `data` to `dest`.
    fn send_async(
        &self,
        dest: usize,
        tag: Tag,
        data: Vec<u8>,
    ) -> Result<Self::SendRequest, CommError>;

    /// Start receiving a message of exactly `len` bytes from `source`.
    fn recv_async(
        &self,
        source: usize,
        tag: Tag,
        len: usize,
    ) -> Result<Self::RecvRequest, CommError>;

    /// Complete a send.
    fn wait_send(&self, request: Self::SendRequest) -> Result<(), CommError>;

    /// Complete a receive and return the message.
    fn wait_recv(&self, request: Self::RecvRequest) -> Result<Vec<u8>, CommError>;

    /// Abort the run on all ranks.
    fn abort(&self, code: i32);
}

/// All-reduce of a single `u64`.
pub fn all_reduce_scalar<C: Communicator>(
    comm: &C,
    value: u64,
    op: ReduceOp,
) -> Result<u64, CommError> {
    let mut values = [value];
    comm.all_reduce_u64(&mut values, op)?;
    Ok(values[0])
}

/// Exchange byte messages with a set of peers.
///
/// `outgoing` holds `(destination, data)` pairs, `incoming` holds
/// `(source, length)` pairs. Empty messages are skipped on both sides, so
/// sender and receiver must agree on which messages are empty. Returns the
/// received messages in the order of `incoming`.
pub fn exchange_buffers<C: Communicator>(
    comm: &C,
    tag: Tag,
    outgoing: Vec<(usize, Vec<u8>)>,
    incoming: &[(usize, usize)],
) -> Result<Vec<Vec<u8>>, CommError> {
    let mut receives = Vec::with_capacity(incoming.len());
    for &(source, len) in incoming {
        if len > 0 {
            receives.push(Some(comm.recv_async(source, tag, len)?));
        } else {
            receives.push(None);
        }
    }

    let mut sends = Vec::with_capacity(outgoing.len());
    for (dest, data) in outgoing {
        if !data.is_empty() {
            sends.push(comm.send_async(dest, tag, data)?);
        }
    }

    let mut messages = Vec::with_capacity(incoming.len());
    for receive in receives {
        match receive {
            Some(request) => messages.push(comm.wait_recv(request)?),
            None => messages.push(Vec::new()),
        }
    }
    for send in sends {
        comm.wait_send(send)?;
    }

    Ok(messages)
}

/// Send one `u64` to every peer and receive one from every peer.
///
/// Entry `r` of `counts` goes to rank `r`. Returns the values received from
/// each rank, the own entry is copied through.
pub fn exchange_counts<C: Communicator>(comm: &C, counts: &[u64]) -> Result<Vec<u64>, CommError> {
    let (rank, size) = (comm.rank(), comm.size());
    debug_assert_eq!(counts.len(), size);

    let peers = (0..size).filter(|&peer| peer != rank).collect::<Vec<_>>();
    let outgoing = peers
        .iter()
        .map(|&peer| (peer, counts[peer].to_le_bytes().to_vec()))
        .collect();
    let incoming = peers.iter().map(|&peer| (peer, 8)).collect::<Vec<_>>();

    let messages = exchange_buffers(comm, MessageTag::Counts.tag(), outgoing, &incoming)?;

    let mut received = vec![0; size];
    received[rank] = counts[rank];
    for (&peer, message) in peers.iter().zip(messages) {
        let bytes: [u8; 8] = message.as_slice().try_into().map_err(|_| CommError::SizeMismatch {
            peer,
            tag: MessageTag::Counts.tag(),
            expected: 8,
            received: message.len(),
        })?;
        received[peer] = u64::from_le_bytes(bytes);
    }
    Ok(received)
}

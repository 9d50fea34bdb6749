//! Ranks as threads of a single process.
//!
//! Every rank owns a mailbox of byte messages keyed by source rank and tag.
//! Sends are buffered and complete immediately, receives block on the
//! mailbox until the message arrives, the cluster is aborted or the timeout
//! expires. Messages between a pair of ranks with the same tag never overtake
//! each other.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{Communicator, ReduceOp, Tag};
use crate::error::CommError;

/// Tag of the messages used to implement reductions.
const REDUCE_TAG: Tag = -1;

/// Default time a receive waits before failing.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Default)]
struct Mailbox {
    queues: Mutex<HashMap<(usize, Tag), VecDeque<Vec<u8>>>>,
    arrived: Condvar,
}

struct Shared {
    mailboxes: Vec<Mailbox>,
    aborted: Mutex<Option<(usize, i32)>>,
    timeout: Duration,
}

impl Shared {
    fn aborted(&self) -> Option<CommError> {
        let aborted = *self.aborted.lock();
        aborted.map(|(rank, code)| CommError::Aborted { rank, code })
    }

    fn abort(&self, rank: usize, code: i32) {
        {
            let mut aborted = self.aborted.lock();
            if aborted.is_none() {
                *aborted = Some((rank, code));
            }
        }
        // Taking the lock guarantees that no receiver misses the wake up.
        for mailbox in &self.mailboxes {
            let _queues = mailbox.queues.lock();
            mailbox.arrived.notify_all();
        }
    }
}

/// A group of ranks sharing one process.
pub struct LocalCluster {
    shared: Arc<Shared>,
}

/// The communicator of one rank of a [LocalCluster].
pub struct LocalComm {
    rank: usize,
    shared: Arc<Shared>,
}

/// Pending send of a [LocalComm]. Sends are buffered, so it is always complete.
#[derive(Debug)]
pub struct LocalSendRequest;

/// Pending receive of a [LocalComm].
#[derive(Debug)]
pub struct LocalRecvRequest {
    source: usize,
    tag: Tag,
    len: usize,
}

/// Aborts the cluster if a rank panics, so that its peers do not wait for the timeout.
struct AbortOnPanic<'a> {
    comm: &'a LocalComm,
}

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.comm.abort(-1);
        }
    }
}

impl LocalCluster {
    /// Create a cluster of `size` ranks.
    pub fn new(size: usize) -> Self {
        Self::with_timeout(size, DEFAULT_TIMEOUT)
    }

    /// Create a cluster whose receives fail after `timeout`.
    pub fn with_timeout(size: usize, timeout: Duration) -> Self {
        assert!(size > 0, "a cluster needs at least one rank");
        Self {
            shared: Arc::new(Shared {
                mailboxes: (0..size).map(|_| Mailbox::default()).collect(),
                aborted: Mutex::new(None),
                timeout,
            }),
        }
    }

    /// Number of ranks.
    pub fn size(&self) -> usize {
        self.shared.mailboxes.len()
    }

    /// One communicator per rank.
    pub fn communicators(&self) -> Vec<LocalComm> {
        (0..self.size())
            .map(|rank| LocalComm {
                rank,
                shared: Arc::clone(&self.shared),
            })
            .collect()
    }

    /// Run `f` on every rank of this cluster, each in its own thread.
    ///
    /// Returns the results in rank order. A panic on any rank aborts the
    /// cluster and is propagated once all threads finished.
    pub fn run_with<T, F>(&self, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(LocalComm) -> T + Sync,
    {
        let f = &f;
        std::thread::scope(|scope| {
            let handles = self
                .communicators()
                .into_iter()
                .map(|comm| {
                    scope.spawn(move || {
                        let guard_comm = LocalComm {
                            rank: comm.rank,
                            shared: Arc::clone(&comm.shared),
                        };
                        let _guard = AbortOnPanic { comm: &guard_comm };
                        f(comm)
                    })
                })
                .collect::<Vec<_>>();

            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(value) => value,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }

    /// Run `f` on `size` ranks of a new cluster.
    pub fn run<T, F>(size: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(LocalComm) -> T + Sync,
    {
        Self::new(size).run_with(f)
    }
}

impl LocalComm {
    fn check_rank(&self, rank: usize) -> Result<(), CommError> {
        if rank < self.shared.mailboxes.len() {
            Ok(())
        } else {
            Err(CommError::InvalidRank {
                rank,
                size: self.shared.mailboxes.len(),
            })
        }
    }

    fn post(&self, dest: usize, tag: Tag, data: Vec<u8>) -> Result<(), CommError> {
        self.check_rank(dest)?;
        if let Some(error) = self.shared.aborted() {
            return Err(error);
        }
        let mailbox = &self.shared.mailboxes[dest];
        mailbox
            .queues
            .lock()
            .entry((self.rank, tag))
            .or_default()
            .push_back(data);
        mailbox.arrived.notify_all();
        Ok(())
    }

    fn take(&self, source: usize, tag: Tag) -> Result<Vec<u8>, CommError> {
        let mailbox = &self.shared.mailboxes[self.rank];
        let deadline = Instant::now() + self.shared.timeout;
        let mut queues = mailbox.queues.lock();
        loop {
            if let Some(message) = queues
                .get_mut(&(source, tag))
                .and_then(|queue| queue.pop_front())
            {
                return Ok(message);
            }
            if let Some(error) = self.shared.aborted() {
                return Err(error);
            }
            if mailbox.arrived.wait_until(&mut queues, deadline).timed_out() {
                if let Some(message) = queues
                    .get_mut(&(source, tag))
                    .and_then(|queue| queue.pop_front())
                {
                    return Ok(message);
                }
                return Err(CommError::Timeout { peer: source, tag });
            }
        }
    }

    /// Reduce by sending the local values to every peer and folding all
    /// contributions in rank order, so that every rank computes the same result.
    fn all_reduce_bytes<T: Copy>(
        &self,
        values: &mut [T],
        encode: impl Fn(T) -> [u8; 8],
        decode: impl Fn([u8; 8]) -> T,
        combine: impl Fn(T, T) -> T,
    ) -> Result<(), CommError> {
        let size = self.size();
        if size == 1 {
            return Ok(());
        }

        let bytes = values.iter().flat_map(|&value| encode(value)).collect::<Vec<_>>();
        for peer in (0..size).filter(|&peer| peer != self.rank) {
            self.post(peer, REDUCE_TAG, bytes.clone())?;
        }

        let mut contributions = Vec::with_capacity(size);
        for source in 0..size {
            if source == self.rank {
                contributions.push(values.to_vec());
                continue;
            }
            let message = self.take(source, REDUCE_TAG)?;
            if message.len() != bytes.len() {
                return Err(CommError::SizeMismatch {
                    peer: source,
                    tag: REDUCE_TAG,
                    expected: bytes.len(),
                    received: message.len(),
                });
            }
            contributions.push(
                message
                    .chunks_exact(8)
                    .map(|chunk| {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(chunk);
                        decode(raw)
                    })
                    .collect(),
            );
        }

        for (index, value) in values.iter_mut().enumerate() {
            *value = contributions[1..]
                .iter()
                .fold(contributions[0][index], |acc, contribution| {
                    combine(acc, contribution[index])
                });
        }
        Ok(())
    }
}

impl Communicator for LocalComm {
    type SendRequest = LocalSendRequest;
    type RecvRequest = LocalRecvRequest;

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.mailboxes.len()
    }

    fn all_reduce_u64(&self, values: &mut [u64], op: ReduceOp) -> Result<(), CommError> {
        self.all_reduce_bytes(values, u64::to_ne_bytes, u64::from_ne_bytes, |a, b| {
            op.apply_u64(a, b)
        })
    }

    fn all_reduce_f64(&self, values: &mut [f64], op: ReduceOp) -> Result<(), CommError> {
        self.all_reduce_bytes(values, f64::to_ne_bytes, f64::from_ne_bytes, |a, b| {
            op.apply_f64(a, b)
        })
    }

    fn send_async(
        &self,
        dest: usize,
        tag: Tag,
        data: Vec<u8>,
    ) -> Result<LocalSendRequest, CommError> {
        self.post(dest, tag, data)?;
        Ok(LocalSendRequest)
    }

    fn recv_async(
        &self,
        source: usize,
        tag: Tag,
        len: usize,
    ) -> Result<LocalRecvRequest, CommError> {
        self.check_rank(source)?;
        Ok(LocalRecvRequest { source, tag, len })
    }

    fn wait_send(&self, _request: LocalSendRequest) -> Result<(), CommError> {
        Ok(())
    }

    fn wait_recv(&self, request: LocalRecvRequest) -> Result<Vec<u8>, CommError> {
        let message = self.take(request.source, request.tag)?;
        if message.len() != request.len {
            return Err(CommError::SizeMismatch {
                peer: request.source,
                tag: request.tag,
                expected: request.len,
                received: message.len(),
            });
        }
        Ok(message)
    }

    fn abort(&self, code: i32) {
        tracing::warn!(rank = self.rank, code, "aborting local cluster");
        self.shared.abort(self.rank, code);
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::LocalCluster;
    use crate::comm::{Communicator, ReduceOp};
    use crate::error::CommError;

    #[test]
    fn test_messages_keep_order() {
        let results = LocalCluster::run(2, |comm| {
            if comm.rank() == 0 {
                for value in 0..5u8 {
                    let request = comm.send_async(1, 3, vec![value; 2]).unwrap();
                    comm.wait_send(request).unwrap();
                }
                Vec::new()
            } else {
                (0..5)
                    .map(|_| {
                        let request = comm.recv_async(0, 3, 2).unwrap();
                        comm.wait_recv(request).unwrap()[0]
                    })
                    .collect()
            }
        });
        assert_eq!(results[1], vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_abort_wakes_peers() {
        let cluster = LocalCluster::with_timeout(3, Duration::from_secs(30));
        let results = cluster.run_with(|comm| {
            if comm.rank() == 2 {
                comm.abort(42);
                return None;
            }
            let mut values = [1u64];
            comm.all_reduce_u64(&mut values, ReduceOp::Sum).err()
        });

        // Peers either finished before the abort or observe it.
        for error in results.into_iter().flatten() {
            assert_eq!(error, CommError::Aborted { rank: 2, code: 42 });
        }
    }

    #[test]
    fn test_timeout_and_size_mismatch() {
        let cluster = LocalCluster::with_timeout(2, Duration::from_millis(50));
        let results = cluster.run_with(|comm| {
            if comm.rank() == 0 {
                let request = comm.recv_async(1, 9, 4).unwrap();
                comm.wait_recv(request).err()
            } else {
                let request = comm.send_async(0, 8, vec![0; 3]).unwrap();
                comm.wait_send(request).unwrap();
                comm.send_async(5, 8, vec![]).err()
            }
        });

        assert_eq!(results[0], Some(CommError::Timeout { peer: 1, tag: 9 }));
        assert_eq!(results[1], Some(CommError::InvalidRank { rank: 5, size: 2 }));
    }
}

//! Error types.

/// Failure of the message passing layer.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CommError {
    /// A rank aborted the run.
    #[error("rank {rank} aborted with code {code}")]
    Aborted {
        /// Rank that called abort.
        rank: usize,
        /// Abort code.
        code: i32,
    },
    /// A receive did not complete in time.
    #[error("timed out waiting for message from rank {peer} with tag {tag}")]
    Timeout {
        /// Source rank of the missing message.
        peer: usize,
        /// Message tag.
        tag: i32,
    },
    /// A message arrived with an unexpected size.
    #[error("message from rank {peer} with tag {tag} has {received} bytes, expected {expected}")]
    SizeMismatch {
        /// Source rank.
        peer: usize,
        /// Message tag.
        tag: i32,
        /// Expected size in bytes.
        expected: usize,
        /// Received size in bytes.
        received: usize,
    },
    /// A rank index outside the communicator.
    #[error("rank {rank} is outside a communicator of size {size}")]
    InvalidRank {
        /// Offending rank.
        rank: usize,
        /// Communicator size.
        size: usize,
    },
    /// Transport specific failure.
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Global tree rebalancing failed.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ImbalanceError {
    /// A leaf at the deepest level still holds more particles than allowed.
    #[error("{count} particles fall into leaf {key:#x} at the deepest level, bucket size is {bucket_size}")]
    Unsplittable {
        /// First key of the leaf.
        key: u64,
        /// Number of particles in the leaf.
        count: u64,
        /// Configured bucket size.
        bucket_size: usize,
    },
    /// The rebalance loop hit its iteration bound.
    #[error("tree did not converge within {iterations} iterations")]
    NotConverged {
        /// Number of iterations performed.
        iterations: usize,
    },
}

/// Errors of the domain decomposition.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// A position lies outside a fixed boundary or is not a finite number.
    #[error("coordinate {value} on axis {axis} lies outside [{lo}, {hi}]")]
    OutOfBounds {
        /// Axis index.
        axis: usize,
        /// Offending coordinate.
        value: f64,
        /// Lower bound of the axis.
        lo: f64,
        /// Upper bound of the axis.
        hi: f64,
    },
    /// Rebalancing the global tree failed.
    #[error("octree rebalance failed: {0}")]
    Imbalance(#[from] ImbalanceError),
    /// More ranks than leaves.
    #[error("cannot assign {leaves} leaves to {ranks} ranks")]
    AssignmentMismatch {
        /// Number of ranks.
        ranks: usize,
        /// Number of leaves available.
        leaves: usize,
    },
    /// Associated arrays disagree in length.
    #[error("array '{name}' has length {found}, expected {expected}")]
    ArrayLengthMismatch {
        /// Name of the array.
        name: String,
        /// Expected length.
        expected: usize,
        /// Actual length.
        found: usize,
    },
    /// Message passing failed.
    #[error("communication failure: {0}")]
    Communication(#[from] CommError),
    /// Box bounds are not ordered.
    #[error("invalid box on axis {axis}: lo = {lo}, hi = {hi}")]
    InvalidBox {
        /// Axis index.
        axis: usize,
        /// Lower bound.
        lo: f64,
        /// Upper bound.
        hi: f64,
    },
    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Ranks hold particle sets with different property layouts.
    #[error("particle property layouts differ between ranks ({min} to {max} bytes per particle)")]
    PropertyMismatch {
        /// Smallest row size over all ranks.
        min: u64,
        /// Largest row size over all ranks.
        max: u64,
    },
    /// Ranks hold properties of the same total size but with different names, order or types.
    #[error("particle property names or types differ between ranks")]
    LayoutMismatch,
    /// A coordinate or smoothing length is not finite, or a smoothing length is negative.
    #[error("particle {index} has invalid {field} {value}")]
    InvalidParticle {
        /// Index of the particle.
        index: usize,
        /// Name of the offending array.
        field: &'static str,
        /// Offending value.
        value: f64,
    },
    /// Another rank failed validation.
    #[error("rank {rank} rejected the synchronization")]
    PeerFailure {
        /// A failing rank.
        rank: usize,
    },
    /// Sender and receiver disagree on the size of a halo message.
    #[error("halo exchange with rank {peer}: expected {expected} particles, peer sends {received}")]
    HaloMismatch {
        /// Peer rank.
        peer: usize,
        /// Locally expected count.
        expected: u64,
        /// Count announced by the peer.
        received: u64,
    },
    /// The focused tree did not reach a fixed point.
    #[error("focused tree did not converge within {0} iterations")]
    FocusDiverged(usize),
}

impl DomainError {
    /// Whether the error ends the run on every rank.
    ///
    /// Validation errors are reported before anything changed and the caller
    /// may retry with corrected input. All other errors leave no valid
    /// decomposition behind.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DomainError::Imbalance(_)
                | DomainError::AssignmentMismatch { .. }
                | DomainError::Communication(_)
                | DomainError::HaloMismatch { .. }
                | DomainError::FocusDiverged(_)
        )
    }

    /// Numeric code passed to `Communicator::abort`.
    pub fn abort_code(&self) -> i32 {
        match self {
            DomainError::OutOfBounds { .. } => 1,
            DomainError::Imbalance(_) => 2,
            DomainError::AssignmentMismatch { .. } => 3,
            DomainError::ArrayLengthMismatch { .. } => 4,
            DomainError::Communication(_) => 5,
            DomainError::InvalidBox { .. } => 6,
            DomainError::Config(_) => 7,
            DomainError::PropertyMismatch { .. } => 8,
            DomainError::PeerFailure { .. } => 9,
            DomainError::HaloMismatch { .. } => 10,
            DomainError::FocusDiverged(_) => 11,
            DomainError::LayoutMismatch => 12,
            DomainError::InvalidParticle { .. } => 13,
        }
    }
}

/// Result type of the crate.
pub type Result<T> = std::result::Result<T, DomainError>;

#[cfg(test)]
mod test {
    use super::{CommError, DomainError, ImbalanceError};

    #[test]
    fn test_fatal_errors() {
        let imbalance = DomainError::from(ImbalanceError::NotConverged { iterations: 64 });
        assert!(imbalance.is_fatal());
        assert!(DomainError::AssignmentMismatch { ranks: 4, leaves: 1 }.is_fatal());
        assert!(DomainError::from(CommError::Transport("closed".to_string())).is_fatal());

        // Rejected input leaves the previous decomposition untouched.
        assert!(!DomainError::LayoutMismatch.is_fatal());
        assert!(!DomainError::PeerFailure { rank: 1 }.is_fatal());
        let invalid = DomainError::InvalidParticle {
            index: 3,
            field: "h",
            value: f64::NAN,
        };
        assert!(!invalid.is_fatal());
        assert_eq!(invalid.to_string(), "particle 3 has invalid h NaN");
    }
}

use std::{error::Error, fmt, io, time::Duration};

/// The backend's result type.
pub type Result<T> = std::result::Result<T, BackendError>;

/// All errors that can occur while distributing a job across the cluster.
#[derive(Debug)]
pub enum BackendError {
    /// The cluster reported no usable resources.
    ResourceDiscovery(String),
    /// Invalid configuration, caught before any worker is started.
    InvalidConfig(String),
    /// Not every worker reported ready before the coordination deadline.
    WorkerGroupStartTimeout {
        timeout: Duration,
        ready: usize,
        expected: usize,
    },
    /// The worker group was already shut down.
    WorkerGroupStopped,
    /// A model's state (or a JSON document) could not be encoded or decoded.
    Serialization(Box<dyn Error + Send + Sync>),
    /// The shared storage entry behind a handle is gone.
    HandleExpired { object_id: u64 },
    /// A closure dispatched to a worker (or a partition task) failed.
    WorkerExecution { rank: usize, msg: String },
    /// A weights vector doesn't fit the model it's applied to.
    WeightsLengthMismatch { got: usize, expected: usize },
    /// A worker finished training with weights different from the canonical worker.
    ReplicaDivergence { rank: usize },
    /// Two metric values under the same name can't be summed.
    MetricShapeMismatch { metric: String },
    /// Training metadata queried before any training happened.
    NotYetTrained(&'static str),
    /// The capability is explicitly not implemented by this backend.
    UnsupportedOperation(String),
    /// The actor system or one of its actors is unreachable.
    Actor(String),
    /// An underlying I/O error not covered by the above variants.
    Io(io::Error),
}

impl BackendError {
    /// Wraps any displayable failure raised on a worker.
    ///
    /// # Args
    /// * `rank` - The rank of the worker (or index of the partition) that failed.
    /// * `err` - The failure.
    ///
    /// # Returns
    /// A `WorkerExecution` error, unless `err` already is one.
    pub fn on_worker(rank: usize, err: BackendError) -> Self {
        match err {
            err @ BackendError::WorkerExecution { .. } => err,
            other => BackendError::WorkerExecution {
                rank,
                msg: other.to_string(),
            },
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceDiscovery(msg) => write!(f, "resource discovery failed: {msg}"),
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::WorkerGroupStartTimeout {
                timeout,
                ready,
                expected,
            } => write!(
                f,
                "worker group start timed out after {}s: {ready}/{expected} workers ready",
                timeout.as_secs_f64()
            ),
            Self::WorkerGroupStopped => f.write_str("worker group was shut down"),
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::HandleExpired { object_id } => {
                write!(f, "object {object_id} was evicted from shared storage")
            }
            Self::WorkerExecution { rank, msg } => write!(f, "worker {rank} error: {msg}"),
            Self::WeightsLengthMismatch { got, expected } => {
                write!(f, "weights length mismatch: got {got}, expected {expected}")
            }
            Self::ReplicaDivergence { rank } => {
                write!(f, "worker {rank} weights diverged from worker 0")
            }
            Self::MetricShapeMismatch { metric } => {
                write!(f, "metric {metric:?} can't be summed: shape mismatch")
            }
            Self::NotYetTrained(what) => write!(f, "{what} is not defined before training"),
            Self::UnsupportedOperation(what) => write!(f, "unsupported operation: {what}"),
            Self::Actor(msg) => write!(f, "actor error: {msg}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Serialization(e) => Some(e.as_ref()),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for BackendError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(Box::new(e))
    }
}

impl From<rmp_serde::encode::Error> for BackendError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Self::Serialization(Box::new(e))
    }
}

impl From<rmp_serde::decode::Error> for BackendError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Self::Serialization(Box::new(e))
    }
}

impl From<actix::MailboxError> for BackendError {
    fn from(e: actix::MailboxError) -> Self {
        Self::Actor(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_worker_keeps_the_original_rank() {
        let inner = BackendError::WorkerExecution {
            rank: 3,
            msg: "boom".into(),
        };

        match BackendError::on_worker(0, inner) {
            BackendError::WorkerExecution { rank, msg } => {
                assert_eq!(rank, 3);
                assert_eq!(msg, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn on_worker_wraps_other_errors() {
        let err = BackendError::on_worker(2, BackendError::HandleExpired { object_id: 7 });
        assert_eq!(
            err.to_string(),
            "worker 2 error: object 7 was evicted from shared storage"
        );
    }
}

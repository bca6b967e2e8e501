// Copyright 2025 FlowerPower Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use config::utils::json;
use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("IoError# {0}")]
    IoError(#[from] std::io::Error),
    #[error("SerdeJsonError# {0}")]
    SerdeJsonError(#[from] json::Error),
    #[error("SqlxError# {0}")]
    SqlxError(#[from] sqlx::Error),
    #[error("RedisError# {0}")]
    RedisError(#[from] redis::RedisError),
    #[error("MongoError# {0}")]
    MongoError(#[from] mongodb::error::Error),
    #[error("InvalidArgument# {0}")]
    InvalidArgument(String),
    #[error("InvalidBackendKind# {0}")]
    InvalidBackendKind(String),
    #[error("InvalidTriggerField# {0}")]
    InvalidTriggerField(String),
    #[error("DuplicateId# {0}")]
    DuplicateId(String),
    #[error("NotFound# {0}")]
    NotFound(String),
    #[error("IllegalTransition# {entity} {id}: {from} -> {to}")]
    IllegalTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },
    #[error("BackendUnavailable# {0}")]
    BackendUnavailable(String),
    #[error("JobTimedOut# {0}")]
    JobTimedOut(String),
    #[error("LeaseExpired# {0}")]
    LeaseExpired(String),
    #[error("UnsupportedOperation# {0}")]
    UnsupportedOperation(String),
    #[error("FunctionNotRegistered# {0}")]
    FunctionNotRegistered(String),
    #[error("WorkerCrashed# {0}")]
    WorkerCrashed(String),
    #[error("Error# {0}")]
    Message(String),
}

impl Error {
    /// Transient transport failures are retried by the queue manager before
    /// they surface as BackendUnavailable.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::IoError(_)
                | Error::SqlxError(_)
                | Error::RedisError(_)
                | Error::MongoError(_)
                | Error::BackendUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::NotFound("job-42".to_string());
        assert_eq!("NotFound# job-42", &err.to_string());

        let err = Error::IllegalTransition {
            entity: "job",
            id: "j1".to_string(),
            from: "finished".to_string(),
            to: "started".to_string(),
        };
        assert_eq!("IllegalTransition# job j1: finished -> started", &err.to_string());
    }

    #[test]
    fn test_transient() {
        assert!(Error::BackendUnavailable("down".into()).is_transient());
        assert!(!Error::NotFound("x".into()).is_transient());
    }
}

use derive_more::From;
use orion_error::{ErrorCode, StructError, UvsReason};

#[derive(Debug, Clone, PartialEq, thiserror::Error, From)]
pub enum CoreReason {
    #[error("edge transport error")]
    Edge,
    #[error("node execution error")]
    NodeExec,
    #[error("expression evaluation error")]
    Eval,
    #[error("alert routing error")]
    Alert,
    #[error("{0}")]
    Uvs(UvsReason),
}

impl ErrorCode for CoreReason {
    fn error_code(&self) -> i32 {
        match self {
            Self::Edge => 1001,
            Self::NodeExec => 1002,
            Self::Eval => 1003,
            Self::Alert => 1004,
            Self::Uvs(u) => u.error_code(),
        }
    }
}

pub type CoreError = StructError<CoreReason>;
pub type CoreResult<T> = Result<T, CoreError>;

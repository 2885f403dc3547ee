use thiserror::Error;

/// The error type shared by every siphon subsystem.
///
/// Validation and Eval errors are fatal to the component/block that raised
/// them. Operational and HealthCheck errors are handled locally by the
/// governor and writer pipeline respectively and normally never reach a
/// caller outside those subsystems.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Validation(String),

    #[error("expression evaluation failed at {path}: {source}")]
    Eval {
        path: String,
        #[source]
        source: EvalError,
    },

    #[error("operational error: {0}")]
    Operational(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("healthcheck failed: {0}")]
    HealthCheck(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn operational(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Operational(Box::new(source))
    }
}

/// Raised by [`crate::expr::Expression::eval`] when a scope lookup, function
/// call, or operator application fails.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("undefined name '{0}'")]
    UndefinedName(String),
    #[error("'{0}' is not a function")]
    NotCallable(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("index error: {0}")]
    Index(String),
}

pub type Result<T> = std::result::Result<T, Error>;

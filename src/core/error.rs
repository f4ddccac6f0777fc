use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid historical dataset: {0}")]
    Dataset(String),
    #[error("cash flow `{name}` is not inflation-adjusted but no inflation series was supplied")]
    MissingInflation { name: String },
    #[error("inflation series covers {actual} years but the horizon needs {required}")]
    InflationTooShort { required: usize, actual: usize },
}

impl SimError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        SimError::Config(msg.into())
    }
}

pub type SimResult<T> = Result<T, SimError>;

use crate::labels::Labels;
use crate::metric::MetricType;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid exposition text on line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("duplicate series {labels} in pushed family '{family}'")]
    DuplicateSeries { family: String, labels: Labels },

    #[error("cannot merge family '{family}': type {existing} != {incoming}")]
    TypeMismatch {
        family: String,
        existing: MetricType,
        incoming: MetricType,
    },
}

impl Error {
    pub(crate) fn parse(line: usize, reason: impl Into<String>) -> Self {
        Error::Parse {
            line,
            reason: reason.into(),
        }
    }
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("failed to decode admission object: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("unsupported resource kind: {0}")]
    UnsupportedKind(String),

    #[error("admission request has no {0}")]
    MissingObject(&'static str),

    #[error("marooned pods need an explicit metadata.name")]
    MissingPodName,
}

/// Input rejected by the task model before anything reaches the backend
/// (bad batch shape, unknown task kind).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),
}

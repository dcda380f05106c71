pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A trigger or worker task died instead of returning; the scheduler
    /// records this when it joins them.
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("unknown scenario: {0}")]
    UnknownScenario(String),

    #[error("`concurrency` must be a positive integer")]
    InvalidConcurrency,

    #[error("setup failed: {0}")]
    Setup(String),

    #[error("stage `{stage}` failed on iteration {iteration}")]
    Iteration { stage: String, iteration: String },

    #[error("stage `{stage}` panicked on iteration {iteration}: {message}")]
    Panic {
        stage: String,
        iteration: String,
        message: String,
    },

    #[error("teardown failed: {0}")]
    Teardown(String),
}

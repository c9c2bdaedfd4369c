#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInput(String),

    #[error("Failed to parse DateTime: {source}")]
    Chrono {
        #[from]
        source: chrono::ParseError,
    },

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Parse duration: {source}")]
    ParseDuration {
        #[from]
        source: parse_duration::parse::Error,
    },

    /// The `SandboxSet` a claim targets does not exist. Terminal for the
    /// claim: the reconciler transitions it straight to `Completed`.
    #[error("pool '{0}' not found")]
    PoolMissing(String),

    /// A required finalizer/leader-election setup step failed during
    /// controller startup.
    #[error("controller failed to initialize: {0}")]
    InitFailed(String),

    /// Another claimant's compare-and-set beat ours to a candidate
    /// sandbox. Not retried as a queue backoff — the Pick Engine moves on
    /// to the next candidate within the same attempt.
    #[error("conflict claiming '{0}'")]
    Conflict(String),

    /// A programming invariant was violated (e.g. an unrecognized
    /// phase). Logged and reported via a Warning event; never requeued,
    /// since retrying cannot fix it.
    #[error("fatal: {0}")]
    Fatal(String),

    /// The backing pod for a sandbox being finalized has not yet
    /// terminated. Returned from the finalizer's Cleanup branch so
    /// `kube`'s finalizer helper does not strip the finalizer until the
    /// pod is actually gone; the work queue's backoff drives the retry.
    #[error("waiting for pod to terminate")]
    PodNotGone,
}

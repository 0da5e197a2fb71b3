use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest<I> {
    pub input: I,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse<S, O> {
    pub state: S,
    pub output: Option<O>,
}

/// Body of a 422: the transition failed and `state` is unchanged.
#[derive(Debug, Serialize)]
pub struct ExecuteFailure<S, I> {
    pub error: String,
    pub state: S,
    pub input: I,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

use serde::{Deserialize, Serialize};

// 429 payload sent when a request is refused
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RateLimitedBody {
    pub error: String,
    #[serde(rename = "retryAfter")]
    pub retry_after: u64, // seconds until the window resets
}

// Generic error payload
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ErrorBody {
    pub error: String,
}

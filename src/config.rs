use clap::Parser;
use std::time::Duration;

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "debt-flow-guard")]
#[command(about = "Rate limiting gateway for the Smart Debt Flow auth endpoints")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    // Upstream application that receives admitted requests
    // Example: "http://localhost:3000"
    #[arg(short, long, default_value = "http://localhost:3000")]
    pub upstream: String,

    // How often expired rate limit entries are swept, in seconds
    #[arg(long, default_value_t = 300)]
    pub sweep_interval: u64,

    // Take the client IP from x-forwarded-for before the socket address.
    // Only safe behind a reverse proxy that overwrites the header.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub trust_forwarded_for: bool,

    // Upstream request timeout in seconds
    #[arg(long, default_value_t = 10)]
    pub upstream_timeout: u64,
}

impl Args {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }
}

/// Limits applied to one category of action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_size_in_seconds: u64,
    /// Label used in logs only.
    pub identifier: &'static str,
}

pub const LOGIN: RateLimitConfig = RateLimitConfig {
    max_requests: 5,
    window_size_in_seconds: 60,
    identifier: "login",
};

pub const SIGNUP: RateLimitConfig = RateLimitConfig {
    max_requests: 3,
    window_size_in_seconds: 60,
    identifier: "signup",
};

pub const VERIFY_TURNSTILE: RateLimitConfig = RateLimitConfig {
    max_requests: 10,
    window_size_in_seconds: 60,
    identifier: "verify-turnstile",
};

pub const DEFAULT: RateLimitConfig = RateLimitConfig {
    max_requests: 20,
    window_size_in_seconds: 60,
    identifier: "default",
};

impl RateLimitConfig {
    /// Resolve a named profile. Unknown names get the default profile.
    pub fn for_action(action: &str) -> &'static RateLimitConfig {
        match action {
            "login" => &LOGIN,
            "signup" => &SIGNUP,
            "verify-turnstile" => &VERIFY_TURNSTILE,
            _ => &DEFAULT,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_size_in_seconds)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        DEFAULT
    }
}

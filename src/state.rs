// app's shared state

pub struct AppState {
    pub client: reqwest::Client,
    pub upstream: String, // base url admitted requests are forwarded to
}

impl AppState {
    pub fn new(client: reqwest::Client, upstream: &str) -> Self {
        // add http:// if not present
        let upstream = upstream.trim().trim_end_matches('/');
        let upstream = if upstream.starts_with("http") {
            upstream.to_string()
        } else {
            format!("http://{}", upstream)
        };

        Self { client, upstream }
    }
}

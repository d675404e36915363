//! Four-timestamp latency accounting (spec.md §4.6): pre-forward, sent,
//! received, post-forward, broken into preprocess/server/postprocess spans.

use std::time::{Duration, Instant};

use tracing::debug;

pub struct RequestTiming {
    method: &'static str,
    pre_forward: Instant,
    sent: Option<Instant>,
    received: Option<Instant>,
}

impl RequestTiming {
    pub fn start(method: &'static str) -> Self {
        Self {
            method,
            pre_forward: Instant::now(),
            sent: None,
            received: None,
        }
    }

    /// Call immediately before the outbound CRI request leaves for the
    /// runtime, after any cache/policy preprocessing.
    pub fn mark_sent(&mut self) {
        self.sent = Some(Instant::now());
    }

    /// Call immediately after the outbound reply arrives, before any
    /// postprocessing (cache commit, effector write) runs.
    pub fn mark_received(&mut self) {
        self.received = Some(Instant::now());
    }

    pub fn finish(self, ok: bool) {
        let post_forward = Instant::now();
        let sent = self.sent.unwrap_or(self.pre_forward);
        let received = self.received.unwrap_or(post_forward);
        let preprocess: Duration = sent.saturating_duration_since(self.pre_forward);
        let server: Duration = received.saturating_duration_since(sent);
        let postprocess: Duration = post_forward.saturating_duration_since(received);
        debug!(
            method = self.method,
            ok,
            preprocess_us = preprocess.as_micros() as u64,
            server_us = server.as_micros() as u64,
            postprocess_us = postprocess.as_micros() as u64,
            "cri call complete"
        );
    }
}

//! Waiting helpers for asynchronous expectations
#![allow(dead_code)] // Test utilities may not all be used in every test

use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

pub const DEFAULT_WAIT: Duration = Duration::from_secs(2);

/// Poll `condition` until it holds, panicking with `what` after `DEFAULT_WAIT`
pub async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + DEFAULT_WAIT;
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Collect `count` envelopes, unpacking frames the writer coalesced
pub async fn recv_envelopes(
    frames: &mut mpsc::UnboundedReceiver<String>,
    count: usize,
) -> Vec<serde_json::Value> {
    let mut envelopes = Vec::new();
    while envelopes.len() < count {
        let frame = tokio::time::timeout(DEFAULT_WAIT, frames.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("frame channel closed");
        for line in frame.lines() {
            envelopes.push(serde_json::from_str(line).expect("frame should be JSON"));
        }
    }
    envelopes
}

/// Nothing arrives within a short grace period
pub async fn assert_silent(frames: &mut mpsc::UnboundedReceiver<String>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(frames.try_recv().is_err(), "expected no frames");
}

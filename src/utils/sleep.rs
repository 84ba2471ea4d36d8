//! Sleep utilities

use std::time::Duration;

/// Pause between two successive commands on a link. Zero disables pacing.
pub async fn pace(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// Sleep for the given number of milliseconds.
pub async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

// Per-user sliding-window admission control

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct Windows {
    by_user: HashMap<String, VecDeque<Instant>>,
    last_sweep: Instant,
}

pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    hits: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            hits: Mutex::new(Windows {
                by_user: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Record a request for `user_id`. On rejection, returns seconds until a slot frees up.
    pub async fn check(&self, user_id: &str) -> Result<(), u64> {
        if self.max_requests == 0 {
            return Ok(());
        }

        let now = Instant::now();
        let mut hits = self.hits.lock().await;

        // Users whose newest hit has aged out hold no quota; drop them once per window
        if now.duration_since(hits.last_sweep) >= self.window {
            let span = self.window;
            hits.by_user
                .retain(|_, w| w.back().is_some_and(|t| now.duration_since(*t) < span));
            hits.last_sweep = now;
        }

        let window = hits.by_user.entry(user_id.to_string()).or_default();
        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) >= self.window {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= self.max_requests as usize {
            let retry_after = window
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            return Err(retry_after.as_secs().max(1));
        }

        window.push_back(now);
        Ok(())
    }

    /// Number of users currently holding a window
    pub async fn tracked_users(&self) -> usize {
        self.hits.lock().await.by_user.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.check("alice").await.is_ok());
        assert!(limiter.check("alice").await.is_ok());
        let retry_after = limiter.check("alice").await.unwrap_err();
        assert_eq!(retry_after, 60);

        // Other users are unaffected
        assert!(limiter.check("bob").await.is_ok());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check("alice").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_users_are_evicted() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        for user in ["alice", "bob", "carol"] {
            assert!(limiter.check(user).await.is_ok());
        }
        assert_eq!(limiter.tracked_users().await, 3);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check("dave").await.is_ok());
        assert_eq!(limiter.tracked_users().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_users_survive_sweep() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("alice").await.is_ok());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(limiter.check("bob").await.is_ok());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(limiter.check("carol").await.is_ok());
        assert_eq!(limiter.tracked_users().await, 2);
        // bob's hit is still inside the window
        assert!(limiter.check("bob").await.is_err());
    }

    #[tokio::test]
    async fn test_zero_disables_limit() {
        let limiter = RateLimiter::new(0, Duration::from_secs(60));
        for _ in 0..100 {
            assert!(limiter.check("alice").await.is_ok());
        }
    }
}

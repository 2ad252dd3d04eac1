use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Sliding-window request budget shared by every clone of an engine.
#[derive(Clone, Debug)]
pub struct ThroughputLimiter {
    admitted: Arc<Mutex<VecDeque<Instant>>>,
    window: Duration,
    limit: u32,
}

impl ThroughputLimiter {
    /// A `limit` of zero admits everything.
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            admitted: Arc::new(Mutex::new(VecDeque::new())),
            window,
            limit,
        }
    }

    pub fn admit(&self) -> bool {
        if self.limit == 0 {
            return true;
        }

        let now = Instant::now();
        let mut admitted = match self.admitted.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        prune_queue(&mut admitted, now, self.window);
        if admitted.len() >= self.limit as usize {
            return false;
        }
        admitted.push_back(now);
        true
    }
}

fn prune_queue(queue: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = queue.front() {
        if now.duration_since(*front) > window {
            queue.pop_front();
        } else {
            break;
        }
    }
}

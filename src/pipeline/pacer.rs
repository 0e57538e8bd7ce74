use std::thread::sleep;
use std::time::{Duration, Instant};

/// Token bucket limiting how many frames per second a stream emits.
///
/// Runs on the stream's blocking thread, so waiting is a plain thread sleep.
pub struct FramePacer {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last: Instant,
}

impl FramePacer {
    /// `None` when `max_fps` is zero or not a usable rate.
    pub fn new(max_fps: f64) -> Option<Self> {
        if !max_fps.is_finite() || max_fps <= 0.0 {
            return None;
        }
        Some(FramePacer {
            capacity: 1.0,
            tokens: 1.0,
            refill_rate: max_fps,
            last: Instant::now(),
        })
    }

    /// Blocks until the next frame may be sent.
    pub fn wait(&mut self) {
        loop {
            let now = Instant::now();
            let elapsed = now.duration_since(self.last).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last = now;
            if self.tokens >= 1.0 {
                self.tokens -= 1.0;
                break;
            }
            let need = 1.0 - self.tokens;
            sleep(Duration::from_secs_f64(need / self.refill_rate));
        }
    }
}

use std::{collections::VecDeque, time::Duration};

struct Sample {
    rays: u64,
    elapsed: Duration,
}

/// Rolling average of rays traced per second, fed one sample per
/// completed frame.
pub struct RayRateCounter {
    samples: VecDeque<Sample>,
    rays: u64,
    elapsed: Duration,
    window: Duration,
}

impl RayRateCounter {
    pub fn new(window: Duration) -> Self {
        assert!(!window.is_zero(), "Zero averaging window");
        RayRateCounter {
            samples: VecDeque::new(),
            rays: 0,
            elapsed: Duration::ZERO,
            window,
        }
    }

    pub fn add_sample(&mut self, rays: u64, elapsed: Duration) {
        if elapsed >= self.window {
            // A single frame longer than the window replaces everything.
            self.samples.clear();
            self.rays = rays;
            self.elapsed = elapsed;
            self.samples.push_back(Sample { rays, elapsed });
            return;
        }

        while self.elapsed + elapsed > self.window {
            match self.samples.pop_front() {
                Some(old) => {
                    self.rays -= old.rays;
                    self.elapsed = self
                        .elapsed
                        .checked_sub(old.elapsed)
                        .unwrap_or(Duration::ZERO);
                }
                None => {
                    debug_assert_eq!(self.rays, 0);
                    break;
                }
            }
        }

        self.rays += rays;
        self.elapsed += elapsed;
        self.samples.push_back(Sample { rays, elapsed });
    }

    pub fn rays_per_second(&self) -> f64 {
        if self.elapsed.is_zero() {
            0.0
        } else {
            self.rays as f64 / self.elapsed.as_secs_f64()
        }
    }
}

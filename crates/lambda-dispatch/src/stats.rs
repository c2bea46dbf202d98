use std::collections::VecDeque;

/// Mean of the last `window` samples, in integer milliseconds. Starts at 0
/// until the first sample lands.
#[derive(Debug)]
pub(crate) struct RollingAverage {
    window: usize,
    samples: VecDeque<u64>,
    sum: u64,
    avg: u64,
}

impl RollingAverage {
    pub(crate) fn new(window: usize) -> Self {
        Self {
            window,
            samples: VecDeque::with_capacity(window),
            sum: 0,
            avg: 0,
        }
    }

    pub(crate) fn add(&mut self, sample: u64) {
        self.samples.push_back(sample);
        self.sum += sample;
        if self.samples.len() > self.window {
            if let Some(evicted) = self.samples.pop_front() {
                self.sum -= evicted;
            }
        }
        self.avg = self.sum / self.samples.len() as u64;
    }

    pub(crate) fn avg(&self) -> u64 {
        self.avg
    }
}

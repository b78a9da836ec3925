/// Windowed max filter over round counts
///
/// Kathleen Nichols' algorithm as used by the Linux kernel's `win_minmax`: the best, 2nd best
/// and 3rd best samples are kept with the invariant that the measurement round of the n'th best
/// is at least that of the (n-1)'th. A new overall max replaces everything, since it is both the
/// largest and the most recent sample.
#[derive(Copy, Clone, Debug)]
pub(super) struct MinMax {
    /// Rounds after which a sample falls out of the window
    window: u64,
    samples: [MinMaxSample; 3],
}

impl MinMax {
    pub(super) fn get(&self) -> u64 {
        self.samples[0].value
    }

    pub(super) fn reset(&mut self) {
        self.samples.fill(MinMaxSample::default());
    }

    pub(super) fn update_max(&mut self, current_round: u64, measurement: u64) {
        let sample = MinMaxSample {
            round: current_round,
            value: measurement,
        };

        if self.samples[0].value == 0
            || sample.value >= self.samples[0].value
            || sample.round.saturating_sub(self.samples[2].round) > self.window
        {
            self.samples.fill(sample);
            return;
        }

        if sample.value >= self.samples[1].value {
            self.samples[2] = sample;
            self.samples[1] = sample;
        } else if sample.value >= self.samples[2].value {
            self.samples[2] = sample;
        }

        self.subwin_update(sample);
    }

    /// As time advances, update the 1st, 2nd, and 3rd choices.
    fn subwin_update(&mut self, sample: MinMaxSample) {
        let dt = sample.round.saturating_sub(self.samples[0].round);
        if dt > self.window {
            // Passed the entire window without a new max: promote the 2nd and 3rd choices,
            // twice if the 2nd choice is also outside the window.
            self.samples[0] = self.samples[1];
            self.samples[1] = self.samples[2];
            self.samples[2] = sample;
            if sample.round.saturating_sub(self.samples[0].round) > self.window {
                self.samples[0] = self.samples[1];
                self.samples[1] = self.samples[2];
                self.samples[2] = sample;
            }
        } else if self.samples[1].round == self.samples[0].round && dt > self.window / 4 {
            // A quarter of the window passed without a new sample; take a 2nd choice from the
            // 2nd quarter.
            self.samples[2] = sample;
            self.samples[1] = sample;
        } else if self.samples[2].round == self.samples[1].round && dt > self.window / 2 {
            // Half the window passed; take a 3rd choice from the last half.
            self.samples[2] = sample;
        }
    }
}

impl Default for MinMax {
    fn default() -> Self {
        Self {
            window: 10,
            samples: [Default::default(); 3],
        }
    }
}

#[derive(Debug, Copy, Clone, Default)]
struct MinMaxSample {
    /// Round count, not a timestamp
    round: u64,
    value: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_expires_after_window() {
        let round = 25;
        let mut min_max = MinMax::default();
        min_max.update_max(round + 1, 100);
        assert_eq!(100, min_max.get());
        min_max.update_max(round + 3, 120);
        assert_eq!(120, min_max.get());
        min_max.update_max(round + 5, 160);
        assert_eq!(160, min_max.get());
        min_max.update_max(round + 7, 100);
        assert_eq!(160, min_max.get());
        min_max.update_max(round + 10, 100);
        assert_eq!(160, min_max.get());
        min_max.update_max(round + 14, 100);
        assert_eq!(160, min_max.get());
        min_max.update_max(round + 16, 100);
        assert_eq!(100, min_max.get());
        min_max.update_max(round + 18, 130);
        assert_eq!(130, min_max.get());
    }

    #[test]
    fn reset_clears() {
        let mut min_max = MinMax::default();
        min_max.update_max(1, 100);
        min_max.reset();
        assert_eq!(min_max.get(), 0);
        min_max.update_max(2, 50);
        assert_eq!(min_max.get(), 50);
    }
}

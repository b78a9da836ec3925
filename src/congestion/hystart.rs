//! HyStart++ slow start exit, RFC 9406
//!
//! Slow start rounds are delimited by packet numbers: a round ends once a packet sent after
//! the round began is acknowledged. The minimum RTT of each round is compared with the previous
//! round's; a rise beyond a clamped threshold moves the sender into Conservative Slow Start
//! (CSS), which either falls back to slow start when the delay drops again or ends slow start
//! after [`CSS_ROUNDS`] rounds.

use std::time::Duration;

const MIN_RTT_THRESH: Duration = Duration::from_millis(4);
const MAX_RTT_THRESH: Duration = Duration::from_millis(16);
const MIN_RTT_DIVISOR: u32 = 8;
const N_RTT_SAMPLE: u32 = 8;
/// Window growth during CSS is divided by this
pub(super) const CSS_GROWTH_DIVISOR: u64 = 4;
const CSS_ROUNDS: u32 = 5;

#[derive(Debug, Clone)]
pub(super) struct HyStart {
    enabled: bool,
    largest_sent: u64,
    /// Acknowledgement of this packet number ends the current round
    window_end: Option<u64>,
    last_round_min_rtt: Option<Duration>,
    current_round_min_rtt: Option<Duration>,
    rtt_sample_count: u32,
    /// Set while in Conservative Slow Start
    css_baseline_min_rtt: Option<Duration>,
    css_rounds: u32,
}

impl HyStart {
    pub(super) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            largest_sent: 0,
            window_end: None,
            last_round_min_rtt: None,
            current_round_min_rtt: None,
            rtt_sample_count: 0,
            css_baseline_min_rtt: None,
            css_rounds: 0,
        }
    }

    pub(super) fn in_css(&self) -> bool {
        self.css_baseline_min_rtt.is_some()
    }

    pub(super) fn on_sent(&mut self, last_packet_number: u64) {
        self.largest_sent = self.largest_sent.max(last_packet_number);
        if self.window_end.is_none() {
            self.window_end = Some(self.largest_sent);
        }
    }

    pub(super) fn on_rtt_sample(&mut self, latest: Duration) {
        if !self.enabled {
            return;
        }
        self.rtt_sample_count += 1;
        self.current_round_min_rtt = Some(match self.current_round_min_rtt {
            Some(min) => min.min(latest),
            None => latest,
        });
    }

    /// Digest a completed batch of acknowledgements while in slow start
    pub(super) fn on_end_acks(&mut self, largest_acked: Option<u64>) -> Option<Transition> {
        if !self.enabled {
            return None;
        }

        let mut transition = None;
        if !self.in_css() && self.rtt_sample_count >= N_RTT_SAMPLE {
            if let (Some(current), Some(last)) =
                (self.current_round_min_rtt, self.last_round_min_rtt)
            {
                let thresh = (last / MIN_RTT_DIVISOR).clamp(MIN_RTT_THRESH, MAX_RTT_THRESH);
                if current >= last + thresh {
                    self.css_baseline_min_rtt = Some(current);
                    self.css_rounds = 0;
                    transition = Some(Transition::EnterCss);
                }
            }
        }

        let round_done = match (largest_acked, self.window_end) {
            (Some(acked), Some(end)) => acked >= end,
            _ => false,
        };
        if !round_done {
            return transition;
        }

        if let Some(baseline) = self.css_baseline_min_rtt {
            if self
                .current_round_min_rtt
                .is_some_and(|current| current < baseline)
            {
                // Delay increase was spurious
                self.css_baseline_min_rtt = None;
                transition = Some(Transition::ResumeSlowStart);
            } else {
                self.css_rounds += 1;
                if self.css_rounds >= CSS_ROUNDS {
                    transition = Some(Transition::ExitSlowStart);
                }
            }
        }

        self.last_round_min_rtt = self.current_round_min_rtt.take();
        self.rtt_sample_count = 0;
        self.window_end = Some(self.largest_sent + 1);
        transition
    }

    /// Leave slow start and CSS for good
    pub(super) fn reset(&mut self) {
        self.css_baseline_min_rtt = None;
        self.css_rounds = 0;
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(super) enum Transition {
    EnterCss,
    ResumeSlowStart,
    ExitSlowStart,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round(hystart: &mut HyStart, pn: &mut u64, rtt: Duration) -> Vec<Transition> {
        let mut out = Vec::new();
        let start = *pn;
        for _ in 0..N_RTT_SAMPLE {
            hystart.on_sent(*pn);
            *pn += 1;
        }
        for acked in start..*pn {
            hystart.on_rtt_sample(rtt);
            out.extend(hystart.on_end_acks(Some(acked)));
        }
        out
    }

    #[test]
    fn delay_increase_enters_css_then_exits() {
        let mut hystart = HyStart::new(true);
        let mut pn = 0;
        for _ in 0..3 {
            assert!(round(&mut hystart, &mut pn, Duration::from_millis(50)).is_empty());
        }

        let mut events = Vec::new();
        for _ in 0..10 {
            events.extend(round(&mut hystart, &mut pn, Duration::from_millis(70)));
        }
        assert_eq!(events.first(), Some(&Transition::EnterCss));
        assert!(events.contains(&Transition::ExitSlowStart));
        assert!(!events.contains(&Transition::ResumeSlowStart));
    }

    #[test]
    fn spurious_increase_resumes_slow_start() {
        let mut hystart = HyStart::new(true);
        let mut pn = 0;
        for _ in 0..3 {
            round(&mut hystart, &mut pn, Duration::from_millis(40));
        }
        for _ in 0..2 {
            round(&mut hystart, &mut pn, Duration::from_millis(60));
        }
        assert!(hystart.in_css());
        let events = round(&mut hystart, &mut pn, Duration::from_millis(30));
        assert!(events.contains(&Transition::ResumeSlowStart));
        assert!(!hystart.in_css());
    }

    #[test]
    fn disabled_never_transitions() {
        let mut hystart = HyStart::new(false);
        let mut pn = 0;
        round(&mut hystart, &mut pn, Duration::from_millis(10));
        assert!(round(&mut hystart, &mut pn, Duration::from_millis(100)).is_empty());
        assert!(!hystart.in_css());
    }
}

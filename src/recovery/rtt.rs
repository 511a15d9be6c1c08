//! # RTT Estimation
//!
//! Smoothed RTT and RTT variance per RFC 6298, at nanosecond resolution.
//! The ACK-delay correction happens in the detector before a sample reaches
//! [`RttEstimator::update`].

#![forbid(unsafe_code)]

use core::time::Duration;

/// RTT estimator.
///
/// All durations are zero until the first sample; `smoothed_rtt` staying
/// zero is the observable signal that no sample has been recorded yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct RttEstimator {
    /// Most recent RTT sample.
    latest_rtt: Duration,

    /// Exponentially weighted moving average of samples.
    smoothed_rtt: Duration,

    /// Mean deviation of samples from the smoothed RTT.
    rttvar: Duration,

    has_sample: bool,
}

impl RttEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new RTT sample.
    pub fn update(&mut self, latest_rtt: Duration) {
        self.latest_rtt = latest_rtt;

        if !self.has_sample {
            self.smoothed_rtt = latest_rtt;
            self.rttvar = latest_rtt / 2;
            self.has_sample = true;
        } else {
            // rttvar <- 3/4 rttvar + 1/4 |smoothed - latest|
            // smoothed <- 7/8 smoothed + 1/8 latest
            let var_sample = if self.smoothed_rtt > latest_rtt {
                self.smoothed_rtt - latest_rtt
            } else {
                latest_rtt - self.smoothed_rtt
            };
            self.rttvar = (self.rttvar * 3 + var_sample) / 4;
            self.smoothed_rtt = (self.smoothed_rtt * 7 + latest_rtt) / 8;
        }
    }

    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt
    }

    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    /// Whether any sample has been recorded.
    pub fn has_sample(&self) -> bool {
        self.has_sample
    }

    /// Conservative RTT used by loss-delay computations: the larger of the
    /// latest sample and the smoothed estimate.
    pub(crate) fn loss_delay_base(&self) -> Duration {
        self.latest_rtt.max(self.smoothed_rtt)
    }
}

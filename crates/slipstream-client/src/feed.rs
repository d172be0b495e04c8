//! Estimator feed adapters.
//!
//! Each policy samples the timing ledger its own way once per decision: the
//! BOLA family folds the unreliable half's mean throughput into the dual
//! half-life average (falling back to the reliable half early on), the
//! throughput policy smooths a whole-segment sample through its EWMA, and
//! MPC pushes the same sample into the harmonic window.

use slipstream_abr::{AbrKind, Ewma, HarmonicMean, MovingAverage};

use crate::report::Reporter;
use crate::timing::TimingLedger;

#[derive(Debug)]
pub enum ThroughputFeed {
    Bola(MovingAverage),
    Smoothed(Ewma),
    Harmonic(HarmonicMean),
}

impl ThroughputFeed {
    pub fn for_abr(kind: AbrKind, smooth: f64) -> Self {
        match kind {
            AbrKind::Bola | AbrKind::Bpp => ThroughputFeed::Bola(MovingAverage::new()),
            AbrKind::Tput => ThroughputFeed::Smoothed(Ewma::new(smooth)),
            AbrKind::Mpc => ThroughputFeed::Harmonic(HarmonicMean::new()),
        }
    }

    /// Whole-segment throughput sample: fine mode counts delivered bytes,
    /// coarse mode the body sizes.
    fn segment_sample(ledger: &TimingLedger, fine: bool) -> f64 {
        let time = ledger.total_time_all().max(1);
        let size = if fine {
            ledger.total_received()
        } else {
            ledger.total_segment_size()
        };
        size * 8.0 / time as f64
    }

    /// Fold the previous segment's ledger into the estimator and return the
    /// refreshed estimate, kbps.
    pub fn add_sample(
        &mut self,
        ledger: &TimingLedger,
        fine: bool,
        reporter: &mut Reporter,
    ) -> f64 {
        match self {
            ThroughputFeed::Bola(average) => {
                let (mut throughput, _) = ledger.mean_throughput(true);
                let mut time = ledger.total_time(true);
                if throughput == 0.0 {
                    let (reliable, _) = ledger.mean_throughput(false);
                    throughput = reliable;
                    time = ledger.total_time(false);
                }
                average.add_measurement(throughput, time as f64);
                average.throughput()
            }
            ThroughputFeed::Smoothed(ewma) => {
                ewma.add_sample(Self::segment_sample(ledger, fine));
                ewma.throughput()
            }
            ThroughputFeed::Harmonic(harmonic) => {
                harmonic.add_sample(Self::segment_sample(ledger, fine));
                reporter.tp_window(harmonic.window());
                harmonic.throughput()
            }
        }
    }

    /// Current estimate without folding a new sample.
    pub fn throughput(&self) -> f64 {
        match self {
            ThroughputFeed::Bola(average) => average.throughput(),
            ThroughputFeed::Smoothed(ewma) => ewma.throughput(),
            ThroughputFeed::Harmonic(harmonic) => harmonic.throughput(),
        }
    }
}

//! Volume-adaptive threshold reduction: a spike in volume makes the
//! move more significant, so the pivot can confirm on a lower
//! threshold.

use crate::domain::analysis::VolumeAdaptiveSettings;

use super::reduction::{BarColumns, ThresholdReduction};

pub struct VolumeAdaptive {
    settings: VolumeAdaptiveSettings,
}

impl VolumeAdaptive {
    pub fn new(settings: VolumeAdaptiveSettings) -> Self {
        Self { settings }
    }
}

impl ThresholdReduction for VolumeAdaptive {
    fn name(&self) -> &'static str {
        "volume_adaptive"
    }

    fn compute(&self, cols: &BarColumns<'_>, _atr: &[f64]) -> Vec<f64> {
        let volumes = cols.volumes;
        let n = volumes.len();
        let lookback = self.settings.lookback;
        let mut reduction = vec![1.0; n];

        if n < lookback + 1 || lookback == 0 {
            return reduction;
        }

        // Rolling sum over the `lookback` bars preceding i.
        let mut window_sum: f64 = volumes[..lookback].iter().sum();

        for i in lookback..n {
            let avg_vol = window_sum / lookback as f64;
            if avg_vol > 0.0 {
                let ratio = volumes[i] / avg_vol;
                if ratio >= self.settings.spike_mult {
                    let strength = ((ratio - 1.0) / self.settings.headroom).min(1.0);
                    reduction[i] = 1.0 - strength * (1.0 - self.settings.min_reduction);
                }
            }
            window_sum += volumes[i] - volumes[i - lookback];
        }

        reduction
    }
}

//! Adaptive noise gate applied between metering and segmentation.
//!
//! Attenuates low-level blocks instead of hard-muting them, so ambient
//! noise bleeds less into segments without truncating quiet speech.

#[derive(Debug, Clone)]
pub struct NoiseGate {
    enabled: bool,
    threshold: u8,
    attenuation: f32,
}

impl NoiseGate {
    pub fn new(enabled: bool, threshold: u8, attenuation: f32) -> Self {
        Self {
            enabled,
            threshold,
            attenuation,
        }
    }

    /// Attenuate the block in place when its metered level falls below
    /// the gate threshold. Pass-through when disabled or at/above it.
    pub fn apply(&self, samples: &mut [i16], level: u8) {
        if !self.enabled || level >= self.threshold {
            return;
        }
        for s in samples.iter_mut() {
            *s = (f32::from(*s) * self.attenuation) as i16;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attenuates_below_threshold() {
        let gate = NoiseGate::new(true, 20, 0.25);
        let mut block = vec![1000i16; 16];
        gate.apply(&mut block, 10);
        assert!(block.iter().all(|&s| s == 250));
    }

    #[test]
    fn passes_at_or_above_threshold() {
        let gate = NoiseGate::new(true, 20, 0.25);
        let mut block = vec![1000i16; 16];
        gate.apply(&mut block, 20);
        assert!(block.iter().all(|&s| s == 1000));
    }

    #[test]
    fn disabled_gate_is_pass_through() {
        let gate = NoiseGate::new(false, 20, 0.25);
        let mut block = vec![1000i16; 16];
        gate.apply(&mut block, 0);
        assert!(block.iter().all(|&s| s == 1000));
    }
}

//! DLL Clock Adjuster (§4.4): a second-order PLL that turns a scalar
//! fill-level error into a dimensionless rate correction near 1.0.
//!
//! All state is `f32` per the single-precision numeric policy (§4.4):
//! with zero error the correction stays within `2^-20` of 1.0.

/// Unit delays plus the bandwidth-derived coefficients of a second-order
/// DLL (`w0`, `w1`, `w2`). `bw`/`period` are kept only to clamp a single bad
/// `error` sample to `±max_error`; `rate` itself is folded into `w0`/`w1`/`w2`
/// at `set_bw` time and does not need to be retained.
pub struct DllState {
    bw: f32,
    period: u32,
    w0: f32,
    w1: f32,
    w2: f32,
    z1: f32,
    z2: f32,
    z3: f32,
}

impl Default for DllState {
    fn default() -> Self {
        Self::new()
    }
}

impl DllState {
    pub fn new() -> Self {
        let mut dll = Self { bw: 0.0, period: 0, w0: 0.0, w1: 0.0, w2: 0.0, z1: 0.0, z2: 0.0, z3: 0.0 };
        dll.init();
        dll
    }

    /// Resets all delays and the configured bandwidth (§4.4 `init`).
    pub fn init(&mut self) {
        self.bw = 0.0;
        self.period = 0;
        self.w0 = 0.0;
        self.w1 = 0.0;
        self.w2 = 0.0;
        self.z1 = 0.0;
        self.z2 = 0.0;
        self.z3 = 0.0;
    }

    /// Recomputes `w0`/`w1`/`w2` from a loop bandwidth `bw` (Hz), a cycle
    /// `period` (samples), and a sample `rate`. `z1`/`z2`/`z3` are left
    /// untouched so the current correction stays continuous across a
    /// reconfiguration (§4.4 `set_bw`).
    pub fn set_bw(&mut self, bw: f32, period: u32, rate: f32) {
        let w = 2.0 * std::f32::consts::PI * bw / rate;
        self.bw = bw;
        self.period = period;
        let period_f = period as f32;
        self.w0 = 1.0 - (-1.0 * w * period_f).exp();
        self.w1 = w * period_f * self.w0 * std::f32::consts::FRAC_1_SQRT_2;
        self.w2 = w * period_f * self.w0;
    }

    fn max_error(&self) -> f32 {
        (256.0_f32).max(self.period as f32 / 2.0)
    }

    /// Feeds one fill-level error sample through the loop and returns the
    /// next rate correction. `error` is clamped to `±max_error` first so a
    /// single bad measurement cannot drive the loop unstable (§4.4).
    ///
    /// A negative error (buffer running low) pulls the correction above
    /// 1.0 so the consumer speeds up relative to the producer.
    pub fn update(&mut self, error: f32) -> f32 {
        let clamp = self.max_error();
        let error = error.clamp(-clamp, clamp);

        let e = error - self.z1 - self.z2;
        self.z1 += self.z2 + self.w0 * e;
        self.z2 += self.w1 * e;
        self.z3 += self.w2 * e;

        1.0 - self.z3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_error_from_a_fresh_dll_holds_correction_at_one() {
        let mut dll = DllState::new();
        dll.set_bw(0.5, 1024, 48000.0);
        for _ in 0..1000 {
            let correction = dll.update(0.0);
            assert!((correction - 1.0).abs() <= 2f32.powi(-20));
        }
    }

    /// Property 5 (§8): bounded correction for bounded error.
    #[test]
    fn correction_stays_within_quarter_of_unity_for_bounded_error() {
        let mut dll = DllState::new();
        dll.set_bw(0.5, 1024, 48000.0);
        let max_error = dll.max_error();
        for error in [-max_error, -max_error / 2.0, 0.0, max_error / 2.0, max_error] {
            let correction = dll.update(error);
            assert!((correction - 1.0).abs() <= 0.25, "correction {correction} out of band for error {error}");
        }
    }

    /// Scenario E (§8): a single negative error pushes the correction above
    /// 1.0, and it relaxes back down under a long run of zero error.
    #[test]
    fn scenario_e_dll_recovers_from_a_single_bad_sample() {
        let mut dll = DllState::new();
        dll.set_bw(0.5, 1024, 48000.0);

        for _ in 0..1000 {
            let correction = dll.update(0.0);
            assert!((correction - 1.0).abs() < 1e-6);
        }

        let spike = dll.update(-100.0);
        assert!(spike > 1.0);

        let mut last = spike;
        for _ in 0..1000 {
            last = dll.update(0.0);
        }
        assert!((last - 1.0).abs() < 1e-3);
    }

    #[test]
    fn error_beyond_max_is_clamped_before_use() {
        let mut unclamped = DllState::new();
        unclamped.set_bw(0.5, 1024, 48000.0);
        let max_error = unclamped.max_error();

        let mut at_limit = DllState::new();
        at_limit.set_bw(0.5, 1024, 48000.0);

        assert_eq!(unclamped.update(max_error * 10.0), at_limit.update(max_error));
    }

    #[test]
    fn set_bw_preserves_z3_across_reconfiguration() {
        let mut dll = DllState::new();
        dll.set_bw(0.5, 1024, 48000.0);
        dll.update(-50.0);
        let before = dll.z3;
        dll.set_bw(1.0, 1024, 48000.0);
        assert_eq!(dll.z3, before);
    }
}

//! PID controller with integral decay.

/// One PID controller per mount axis.
///
/// The integral accumulator decays by `alpha` each step so stale error
/// history fades instead of winding up. Resetting zeroes both the
/// integral and the previous error, which makes the first derivative term
/// after a reset zero.
#[derive(Debug, Clone)]
pub struct PidController {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub alpha: f64,
    pub dt: f64,
    integral: f64,
    prev_error: f64,
}

impl PidController {
    pub fn new(kp: f64, ki: f64, kd: f64, alpha: f64, dt: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            alpha,
            dt,
            integral: 0.0,
            prev_error: 0.0,
        }
    }

    pub fn compute(&mut self, error: f64) -> f64 {
        let p = self.kp * error;

        self.integral = self.alpha * self.integral + error * self.dt;
        let i = self.ki * self.integral;

        let derivative = (error - self.prev_error) / self.dt;
        let d = self.kd * derivative;
        self.prev_error = error;

        p + i + d
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_error = 0.0;
    }

    pub fn set_gains(&mut self, kp: f64, ki: f64, kd: f64) {
        self.kp = kp;
        self.ki = ki;
        self.kd = kd;
    }
}

impl Default for PidController {
    fn default() -> Self {
        Self::new(2.0, 0.5, 0.5, 0.9, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn proportional_only() {
        let mut pid = PidController::new(2.0, 0.0, 0.0, 0.9, 1.0);
        assert_relative_eq!(pid.compute(3.0), 6.0);
    }

    #[test]
    fn integral_accumulates_with_decay() {
        let mut pid = PidController::new(0.0, 1.0, 0.0, 0.5, 1.0);
        // integral: 0*0.5 + 2 = 2
        assert_relative_eq!(pid.compute(2.0), 2.0);
        // integral: 2*0.5 + 2 = 3
        assert_relative_eq!(pid.compute(2.0), 3.0);
    }

    #[test]
    fn derivative_tracks_error_change() {
        let mut pid = PidController::new(0.0, 0.0, 1.0, 0.9, 1.0);
        assert_relative_eq!(pid.compute(1.0), 1.0);
        assert_relative_eq!(pid.compute(4.0), 3.0);
    }

    #[test]
    fn reset_zeroes_integral_and_derivative_history() {
        let mut pid = PidController::new(0.0, 1.0, 1.0, 0.9, 1.0);
        pid.compute(5.0);
        pid.compute(7.0);
        pid.reset();
        // First step after reset: derivative term must be zero when the
        // error is zero, and the integral starts over.
        assert_relative_eq!(pid.compute(0.0), 0.0);
    }
}

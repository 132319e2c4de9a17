//! Discrete PID controller tuned against a nominal sample period.
//!
//! The controller assumes it is stepped once per control tick of
//! `expected_delta_t` seconds: the integral and derivative gains are scaled
//! by that period at construction, and each `compute` integrates and
//! differentiates over it.

/// Anti-windup bound on the error accumulator, applied before the integral
/// gain scales it.
const MAX_INTEGRAL: f64 = 100.0;

pub struct PidController {
    expected_dt: f64,
    kp: f64,
    ki: f64,
    kd: f64,
    integral: f64,
    previous_error: f64,
}

impl PidController {
    /// `expected_delta_t` is the control loop period in seconds.
    pub fn new(expected_delta_t: f64, integral_gain: f64, derivative_gain: f64) -> Self {
        Self {
            expected_dt: expected_delta_t,
            kp: 1.0,
            ki: integral_gain * expected_delta_t,
            kd: derivative_gain / expected_delta_t,
            integral: 0.0,
            previous_error: 0.0,
        }
    }

    /// One controller step. Positive output means the process variable is
    /// below the setpoint.
    pub fn compute(&mut self, set_point: f64, process_variable: f64) -> f64 {
        let error = set_point - process_variable;

        self.integral =
            (self.integral + error * self.expected_dt).clamp(-MAX_INTEGRAL, MAX_INTEGRAL);
        let derivative = (error - self.previous_error) / self.expected_dt;
        self.previous_error = error;

        self.kp * error + self.ki * self.integral + self.kd * derivative
    }

    /// Clear the accumulated state. Called when regulation is suspended so
    /// a stale integral can't act on re-entry.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.previous_error = 0.0;
    }

    #[cfg(test)]
    fn integral_sum(&self) -> f64 {
        self.integral
    }
}

// ===========================================================================
// Tests
// ===========================================================================

use std::sync::Mutex;

use super::instance::ModelInstance;

const WINDOW_MS: i64 = 60_000;

/// Rolling-minute admission counter for one instance.
///
/// A successful acquire debits one request and the token estimate for the
/// remainder of the window; there is no release. The window resets when 60s
/// elapse or the clock runs backwards. A limit of 0 means uncapped on that
/// dimension (the effective-limit fallbacks make that unreachable for
/// normally configured instances).
#[derive(Debug)]
pub struct MinuteBudget {
    window: Mutex<Window>,
}

#[derive(Debug)]
struct Window {
    start_ms: i64,
    used_rpm: i64,
    used_tpm: i64,
}

impl MinuteBudget {
    pub fn new(now_ms: i64) -> Self {
        Self {
            window: Mutex::new(Window {
                start_ms: now_ms,
                used_rpm: 0,
                used_tpm: 0,
            }),
        }
    }

    /// Admits one request of `estimated_tokens` against the instance's
    /// effective RPM/TPM, or refuses without side effects.
    pub fn try_acquire(&self, instance: &ModelInstance, estimated_tokens: i64, now_ms: i64) -> bool {
        if !instance.is_healthy() {
            return false;
        }
        let mut window = self.window.lock().expect("budget lock poisoned");
        window.roll_if_elapsed(now_ms);

        let rpm_limit = instance.effective_rpm_limit().max(0);
        let tpm_limit = instance.effective_tpm_limit().max(0);
        let next_rpm = window.used_rpm + 1;
        let next_tpm = window.used_tpm + estimated_tokens.max(0);
        if rpm_limit > 0 && next_rpm > rpm_limit {
            return false;
        }
        if tpm_limit > 0 && next_tpm > tpm_limit {
            return false;
        }
        window.used_rpm = next_rpm;
        window.used_tpm = next_tpm;
        true
    }

    /// Monitoring view; evaluates the window roll but consumes nothing.
    pub fn available_rpm(&self, instance: &ModelInstance, now_ms: i64) -> i64 {
        let mut window = self.window.lock().expect("budget lock poisoned");
        window.roll_if_elapsed(now_ms);
        (instance.effective_rpm_limit() - window.used_rpm).max(0)
    }

    pub fn available_tpm(&self, instance: &ModelInstance, now_ms: i64) -> i64 {
        let mut window = self.window.lock().expect("budget lock poisoned");
        window.roll_if_elapsed(now_ms);
        (instance.effective_tpm_limit() - window.used_tpm).max(0)
    }

    pub fn window_start_ms(&self) -> i64 {
        self.window.lock().expect("budget lock poisoned").start_ms
    }
}

impl Window {
    fn roll_if_elapsed(&mut self, now_ms: i64) {
        let elapsed = now_ms - self.start_ms;
        if elapsed >= WINDOW_MS || elapsed < 0 {
            self.start_ms = now_ms;
            self.used_rpm = 0;
            self.used_tpm = 0;
        }
    }
}

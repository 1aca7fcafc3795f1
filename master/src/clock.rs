use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Fuente de tiempo inyectada. El core nunca lee la hora del sistema directo.
pub trait Clock: Send + Sync {
    /// Wall time en ms desde epoch
    fn wall_time(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn wall_time(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Reloj manual para tests: sólo avanza cuando se le pide.
#[derive(Debug, Default)]
pub struct TestClock {
    now: AtomicI64,
}

impl TestClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn wall_time(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

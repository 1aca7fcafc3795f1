use serde::{Deserialize, Serialize};

/// Esquema de espera entre intentos.
///
/// `attempt` empieza en 1 (primer reintento tras el primer fallo);
/// con `attempt == 0` no hay fallos previos y la espera es cero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Backoff {
    Immediate,
    Delayed {
        initial_delay_ms: u64,
        delay_ms: u64,
    },
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
    },
}

impl Backoff {
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }
        match *self {
            Backoff::Immediate => 0,
            Backoff::Delayed {
                initial_delay_ms,
                delay_ms,
            } => {
                if attempt == 1 {
                    initial_delay_ms
                } else {
                    delay_ms
                }
            }
            Backoff::Exponential {
                initial_delay_ms,
                max_delay_ms,
            } => {
                let factor = 2u64.saturating_pow(attempt - 1);
                initial_delay_ms.saturating_mul(factor).min(max_delay_ms)
            }
        }
    }
}

/// Política de reintentos declarada por el usuario para las tareas de un job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    /// Cuántas veces se puede reemplazar una tarea que falló por culpa propia.
    pub retries: u32,
}

impl RetryPolicy {
    pub fn immediate(retries: u32) -> Self {
        Self {
            backoff: Backoff::Immediate,
            retries,
        }
    }

    pub fn delayed(initial_delay_ms: u64, delay_ms: u64, retries: u32) -> Self {
        Self {
            backoff: Backoff::Delayed {
                initial_delay_ms,
                delay_ms,
            },
            retries,
        }
    }

    pub fn exponential(initial_delay_ms: u64, max_delay_ms: u64, retries: u32) -> Self {
        Self {
            backoff: Backoff::Exponential {
                initial_delay_ms,
                max_delay_ms,
            },
            retries,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::immediate(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sin_fallos_no_hay_espera() {
        let b = Backoff::Exponential {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        assert_eq!(b.delay_ms(0), 0);
    }

    #[test]
    fn exponencial_crece_y_se_acota() {
        let b = Backoff::Exponential {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        assert_eq!(b.delay_ms(1), 100);
        assert_eq!(b.delay_ms(2), 200);
        assert_eq!(b.delay_ms(4), 800);
        assert_eq!(b.delay_ms(5), 1_000);
        assert_eq!(b.delay_ms(64), 1_000);
    }

    #[test]
    fn exponencial_con_piso_igual_a_techo_es_fijo() {
        let b = Backoff::Exponential {
            initial_delay_ms: 5_000,
            max_delay_ms: 5_000,
        };
        assert_eq!(b.delay_ms(1), 5_000);
        assert_eq!(b.delay_ms(7), 5_000);
    }

    #[test]
    fn delayed_usa_espera_inicial_y_luego_fija() {
        let p = RetryPolicy::delayed(50, 500, 3);
        assert_eq!(p.backoff.delay_ms(1), 50);
        assert_eq!(p.backoff.delay_ms(2), 500);
        assert_eq!(p.backoff.delay_ms(3), 500);
    }
}

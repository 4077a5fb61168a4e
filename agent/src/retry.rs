//! Reintentos acotados con backoff.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `5·n` unidades: reconcile.
    Linear,
    /// `n²` unidades: sidecar.
    Quadratic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
    pub unit: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        RetryPolicy {
            max_retries,
            backoff,
            unit: Duration::from_secs(1),
        }
    }

    /// Espera antes del intento `attempt` (1 = primer reintento).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = match self.backoff {
            Backoff::Linear => 5 * attempt,
            Backoff::Quadratic => attempt * attempt,
        };
        self.unit * factor
    }

    /// Ejecuta `op` hasta `max_retries` veces más mientras el error sea
    /// reintentable. `on_retry` corre antes de cada espera.
    pub async fn run<T, E, F, Fut, R, RFut>(
        &self,
        what: &str,
        retryable: fn(&E) -> bool,
        mut on_retry: R,
        mut op: F,
    ) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: FnMut() -> RFut,
        RFut: Future<Output = ()>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.max_retries && retryable(&e) => {
                    attempt += 1;
                    let wait = self.delay(attempt);
                    warn!("{} falló ({}), reintento {} en {:?}", what, e, attempt, wait);
                    on_retry().await;
                    sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_lineal_y_cuadratico() {
        let lin = RetryPolicy::new(3, Backoff::Linear);
        assert_eq!(lin.delay(1), Duration::from_secs(5));
        assert_eq!(lin.delay(3), Duration::from_secs(15));
        let quad = RetryPolicy::new(3, Backoff::Quadratic);
        assert_eq!(quad.delay(3), Duration::from_secs(9));
    }

    fn fast(max: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries: max,
            backoff: Backoff::Linear,
            unit: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn reintenta_hasta_el_limite() {
        let calls = &AtomicU32::new(0);
        let restarts = &AtomicU32::new(0);
        let res: Result<(), String> = fast(3)
            .run(
                "op",
                |_| true,
                move || async move {
                    restarts.fetch_add(1, Ordering::SeqCst);
                },
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("caído".to_string())
                },
            )
            .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(restarts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn errores_no_reintentables_salen_enseguida() {
        let calls = &AtomicU32::new(0);
        let res: Result<(), String> = fast(3)
            .run(
                "op",
                |_| false,
                || async {},
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("conflicto".to_string())
                },
            )
            .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exito_tras_un_fallo() {
        let calls = &AtomicU32::new(0);
        let res: Result<u32, String> = fast(3)
            .run("op", |_| true, || async {}, move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err("timeout".into())
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(res, Ok(1));
    }
}

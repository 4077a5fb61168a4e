//! `GET /healthz`: 200 si el último tick fue reciente, 503 si no.

use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct Health {
    last_tick: Arc<Mutex<Option<Instant>>>,
}

impl Health {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marca un tick exitoso.
    pub fn touch(&self) {
        if let Ok(mut t) = self.last_tick.lock() {
            *t = Some(Instant::now());
        }
    }

    /// `true` si hubo un tick exitoso dentro de `interval`.
    pub fn pong(&self, interval: Duration) -> bool {
        self.last_tick
            .lock()
            .ok()
            .and_then(|t| *t)
            .map(|t| t.elapsed() <= interval)
            .unwrap_or(false)
    }
}

#[derive(Clone)]
struct HealthState {
    health: Health,
    interval: Duration,
}

pub fn build_router(health: Health, interval: Duration) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(HealthState { health, interval })
}

async fn healthz(State(state): State<HealthState>) -> (StatusCode, &'static str) {
    if state.health.pong(state.interval) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "stale")
    }
}

pub async fn serve(health: Health, interval: Duration, port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("healthz escuchando en {}", listener.local_addr()?);
    axum::serve(listener, build_router(health, interval)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pong_depende_del_ultimo_tick() {
        let h = Health::new();
        assert!(!h.pong(Duration::from_secs(60)));
        h.touch();
        assert!(h.pong(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!h.pong(Duration::from_millis(1)));
    }

    #[tokio::test]
    async fn endpoint_responde_segun_pong() {
        let h = Health::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(h.clone(), Duration::from_secs(60));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let url = format!("http://{addr}/healthz");
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        h.touch();
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
    }
}

//! Heartbeat helper for servers.

use crate::error::RegistryError;
use crate::http::Registration;
use crate::registry::DEFAULT_TIMEOUT;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Keeps a server's registry entry alive.
///
/// Sends one registration synchronously (its failure is the caller's to
/// handle), then spawns a ticker re-registering every `period`. A zero
/// period defaults to the registry timeout minus one minute, leaving room
/// for a beat before the entry would expire. The first failed beat stops
/// the ticker; there is no reconnection.
pub async fn heartbeat(
    registry_url: &str,
    service: &str,
    rpc_addr: &str,
    period: Duration,
) -> Result<JoinHandle<()>, RegistryError> {
    let period = if period.is_zero() {
        DEFAULT_TIMEOUT - Duration::from_secs(60)
    } else {
        period
    };

    // Beats are minutes apart; a fresh connection per beat, not a pool.
    let http = reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .build()?;
    send_heartbeat(&http, registry_url, service, rpc_addr).await?;

    let registry_url = registry_url.to_string();
    let service = service.to_string();
    let rpc_addr = rpc_addr.to_string();

    Ok(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately; the synchronous beat above
        // already covered it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            tracing::debug!("{} heartbeat to {}", rpc_addr, registry_url);
            if let Err(e) = send_heartbeat(&http, &registry_url, &service, &rpc_addr).await {
                tracing::warn!("heartbeat failed, stopping: {}", e);
                break;
            }
        }
    }))
}

async fn send_heartbeat(
    http: &reqwest::Client,
    registry_url: &str,
    service: &str,
    rpc_addr: &str,
) -> Result<(), RegistryError> {
    let registration = Registration {
        service: service.to_string(),
        addr: rpc_addr.to_string(),
    };
    http.post(registry_url)
        .json(&registration)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

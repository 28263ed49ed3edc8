//! Heartbeat loop telling the DM the machine is alive.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use convoy_id::ChannelId;
use convoy_messaging::{Message, MessagingClient};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;

/// Failures tolerated before heartbeat errors are logged as errors.
const MAX_QUIET_FAILURES: u32 = 3;

/// Run the heartbeat loop until shutdown.
pub async fn run_heartbeat_loop(
    config: Config,
    client: Arc<dyn MessagingClient>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let interval = Duration::from_secs(config.heartbeat_interval_secs);
    let channel = ChannelId::dm(&config.application);
    let heartbeat = Message::Heartbeat {
        scope: config.scoped_instance.clone(),
        ip_address: config.ip_address.clone(),
    };

    info!(
        app = %config.application,
        scope = %config.scoped_instance,
        interval_secs = config.heartbeat_interval_secs,
        "Starting heartbeat loop"
    );

    let mut consecutive_failures = 0u32;
    let mut interval_timer = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                match client.send(&channel, &heartbeat).await {
                    Ok(()) => {
                        if consecutive_failures > 0 {
                            info!(consecutive_failures, "Heartbeat delivered again");
                        }
                        consecutive_failures = 0;
                        debug!(channel = %channel, "Heartbeat sent");
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures <= MAX_QUIET_FAILURES {
                            warn!(
                                error = %e,
                                consecutive_failures,
                                "Heartbeat failed"
                            );
                        } else {
                            error!(
                                error = %e,
                                consecutive_failures,
                                "Heartbeat failed repeatedly"
                            );
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Heartbeat loop shutting down");
                    break;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_id::InstancePath;
    use convoy_testing::RecordingClient;

    fn config() -> Config {
        Config {
            application: "shop".to_string(),
            scoped_instance: InstancePath::parse("/vm1").unwrap(),
            messaging_type: "recording".to_string(),
            heartbeat_interval_secs: 30,
            ip_address: Some("10.0.0.3".to_string()),
            log_level: "debug".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_follow_the_interval() {
        let client = RecordingClient::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_heartbeat_loop(
            config(),
            Arc::new(client.clone()),
            shutdown_rx,
        ));

        // First tick is immediate, then one per interval.
        tokio::time::sleep(Duration::from_secs(65)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let sent = client.sent_to(&ChannelId::dm("shop"));
        assert_eq!(sent.len(), 3);
        assert_eq!(
            sent[0],
            Message::Heartbeat {
                scope: InstancePath::parse("/vm1").unwrap(),
                ip_address: Some("10.0.0.3".to_string()),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_the_loop() {
        let client = RecordingClient::new();
        client.set_failing(true);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_heartbeat_loop(
            config(),
            Arc::new(client.clone()),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_secs(125)).await;
        client.set_failing(false);
        tokio::time::sleep(Duration::from_secs(30)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(client.attempts(), 6);
        assert_eq!(client.sent().len(), 1);
    }
}

use anyhow::Result;
use carbon_relay::codec;
use carbon_relay::{ClientManager, Datapoint, Destination, ReconnectPolicy, Router, Settings};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::time::timeout;

#[derive(Default)]
struct StaticRouter {
    routes: Mutex<HashMap<String, Vec<Destination>>>,
}

impl Router for StaticRouter {
    fn add_destination(&self, _destination: &Destination) {}
    fn remove_destination(&self, _destination: &Destination) {}

    fn destinations(&self, metric: &str) -> Vec<Destination> {
        self.routes
            .lock()
            .unwrap()
            .get(metric)
            .cloned()
            .unwrap_or_default()
    }
}

/// Datapoints sent while the endpoint is down are queued, then flushed
/// FIFO once the endpoint comes up and the session reconnects.
#[tokio::test]
async fn backlog_flushes_after_endpoint_comes_up() -> Result<()> {
    // Reserve a port, then close the listener so connects are refused.
    let placeholder = TcpListener::bind("127.0.0.1:0").await?;
    let addr = placeholder.local_addr()?;
    drop(placeholder);

    let destination = Destination::new("127.0.0.1", addr.port(), "a");
    let router = StaticRouter::default();
    router
        .routes
        .lock()
        .unwrap()
        .insert("m".to_string(), vec![destination.clone()]);

    let settings = Settings {
        reconnect: ReconnectPolicy {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(100),
            factor: 2.0,
            jitter: 0.0,
            connect_timeout: Duration::from_secs(2),
        },
        ..Settings::default()
    };
    let mut manager = ClientManager::new(Arc::new(router), &settings);
    manager.start();
    let _attempt = manager.start_client(destination.clone()).expect("new client");

    for t in 1..=10 {
        manager.send_datapoint("m", Datapoint::new(t, t as f64));
    }

    // All ten datapoints end up queued, none on the wire.
    let counters = manager.counters(&destination).expect("known destination");
    timeout(Duration::from_secs(5), async {
        while counters
            .queued_until_connected
            .load(std::sync::atomic::Ordering::Relaxed)
            < 10
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    // Bring the endpoint up on the same port; the next reconnect attempt
    // drains the backlog.
    let listener = TcpListener::bind(addr).await?;
    let (mut stream, _) = timeout(Duration::from_secs(5), listener.accept()).await??;

    let mut received = Vec::new();
    while received.len() < 10 {
        let mut len_bytes = [0u8; 4];
        timeout(Duration::from_secs(5), stream.read_exact(&mut len_bytes)).await??;
        let mut payload = vec![0u8; u32::from_be_bytes(len_bytes) as usize];
        timeout(Duration::from_secs(5), stream.read_exact(&mut payload)).await??;
        received.extend(codec::decode_payload(&payload)?);
    }

    let timestamps: Vec<u64> = received.iter().map(|(_, point)| point.timestamp).collect();
    assert_eq!(timestamps, (1..=10).collect::<Vec<_>>());

    timeout(Duration::from_secs(5), manager.stop()).await?;
    Ok(())
}

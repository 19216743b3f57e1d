use anyhow::Result;
use carbon_relay::codec;
use carbon_relay::{
    ClientManager, ConnectOutcome, Datapoint, Destination, ReconnectPolicy, Router, Settings,
};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// Fixed metric-to-destination mapping standing in for the relay's
/// routing policy.
#[derive(Default)]
struct StaticRouter {
    routes: Mutex<HashMap<String, Vec<Destination>>>,
}

impl StaticRouter {
    fn route(self, metric: &str, destinations: Vec<Destination>) -> Self {
        self.routes
            .lock()
            .unwrap()
            .insert(metric.to_string(), destinations);
        self
    }
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

fn fast_settings() -> Settings {
    Settings {
        reconnect: ReconnectPolicy {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            factor: 2.0,
            jitter: 0.0,
            connect_timeout: Duration::from_secs(2),
        },
        ..Settings::default()
    }
}

/// Read pickle frames off one accepted connection until `expected`
/// datapoints have arrived.
async fn collect_datapoints(listener: TcpListener, expected: usize) -> Vec<(String, Datapoint)> {
    let (stream, _) = listener.accept().await.expect("accept failed");
    read_frames(stream, expected).await
}

async fn read_frames(mut stream: TcpStream, expected: usize) -> Vec<(String, Datapoint)> {
    let mut collected = Vec::new();
    while collected.len() < expected {
        let mut len_bytes = [0u8; 4];
        if stream.read_exact(&mut len_bytes).await.is_err() {
            break;
        }
        let mut payload = vec![0u8; u32::from_be_bytes(len_bytes) as usize];
        stream.read_exact(&mut payload).await.expect("truncated frame");
        collected.extend(codec::decode_payload(&payload).expect("bad pickle payload"));
    }
    collected
}

/// One destination, one datapoint: the wire carries a single pickle batch
/// and the per-destination counters reflect the send.
#[tokio::test]
async fn tcp_delivery_smoke() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let destination = Destination::new("127.0.0.1", port, "a");

    let router =
        StaticRouter::default().route("foo.bar", vec![destination.clone()]);
    let mut manager = ClientManager::new(std::sync::Arc::new(router), &fast_settings());
    manager.start();

    let server = tokio::spawn(collect_datapoints(listener, 1));

    let attempt = manager.start_client(destination.clone()).expect("new client");
    assert_eq!(
        timeout(Duration::from_secs(5), attempt).await?,
        ConnectOutcome::Connected
    );

    manager.send_datapoint("foo.bar", Datapoint::new(100, 1.5));

    let received = timeout(Duration::from_secs(5), server).await??;
    assert_eq!(
        received,
        vec![("foo.bar".to_string(), Datapoint::new(100, 1.5))]
    );

    let counters = manager.counters(&destination).expect("known destination");
    assert_eq!(
        counters
            .attempted_relays
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );

    timeout(Duration::from_secs(5), manager.stop()).await?;
    Ok(())
}

/// A metric routed to two destinations produces one frame on each
/// downstream socket.
#[tokio::test]
async fn tcp_fan_out_to_two_destinations() -> Result<()> {
    let listener_a = TcpListener::bind("127.0.0.1:0").await?;
    let listener_b = TcpListener::bind("127.0.0.1:0").await?;
    let dest_a = Destination::new("127.0.0.1", listener_a.local_addr()?.port(), "a");
    let dest_b = Destination::new("127.0.0.1", listener_b.local_addr()?.port(), "b");

    let router = StaticRouter::default().route("m", vec![dest_a.clone(), dest_b.clone()]);
    let mut manager = ClientManager::new(std::sync::Arc::new(router), &fast_settings());
    manager.start();

    let server_a = tokio::spawn(collect_datapoints(listener_a, 1));
    let server_b = tokio::spawn(collect_datapoints(listener_b, 1));

    let attempt_a = manager.start_client(dest_a.clone()).expect("new client");
    let attempt_b = manager.start_client(dest_b.clone()).expect("new client");
    assert_eq!(
        timeout(Duration::from_secs(5), attempt_a).await?,
        ConnectOutcome::Connected
    );
    assert_eq!(
        timeout(Duration::from_secs(5), attempt_b).await?,
        ConnectOutcome::Connected
    );

    manager.send_datapoint("m", Datapoint::new(7, 2.5));

    let expected = vec![("m".to_string(), Datapoint::new(7, 2.5))];
    assert_eq!(timeout(Duration::from_secs(5), server_a).await??, expected);
    assert_eq!(timeout(Duration::from_secs(5), server_b).await??, expected);

    timeout(Duration::from_secs(5), manager.stop()).await?;
    Ok(())
}

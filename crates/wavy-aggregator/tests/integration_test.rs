// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use mockito::Server;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use wavy_aggregator::{
    collector::TcpCollector,
    config_store::{ConfigStore, DeviceRecord, DeviceStatus, JsonConfigStore},
    durable_log::{DurableLog, FileDurableLog},
    node::{AggregatorNode, Collaborators, NodeConfig},
    protocol::DeviceId,
    transform::{CsvNormalizer, HttpTransform, Transform},
    upstream::select_upstream,
};

/// In-test central collector. Records every frame and answers `ACK` while `accepting` is set.
#[derive(Clone)]
struct FakeCollector {
    address: String,
    frames: Arc<Mutex<Vec<String>>>,
    accepting: Arc<Mutex<bool>>,
}

impl FakeCollector {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("unable to bind collector");
        let collector = FakeCollector {
            address: listener.local_addr().expect("no local addr").to_string(),
            frames: Arc::new(Mutex::new(Vec::new())),
            accepting: Arc::new(Mutex::new(true)),
        };
        let state = collector.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut frame = String::new();
                if stream.read_to_string(&mut frame).await.is_err() {
                    continue;
                }
                let reply = if frame.starts_with("QUEUE_LENGTH") {
                    "0\n"
                } else if *state.accepting.lock().unwrap() {
                    state.frames.lock().unwrap().push(frame);
                    "ACK\n"
                } else {
                    "BUSY\n"
                };
                let _ = stream.write_all(reply.as_bytes()).await;
            }
        });
        collector
    }

    fn frames(&self) -> Vec<String> {
        self.frames.lock().unwrap().clone()
    }

    fn set_accepting(&self, accepting: bool) {
        *self.accepting.lock().unwrap() = accepting;
    }
}

struct Aggregator {
    addr: SocketAddr,
    store: Arc<JsonConfigStore>,
    log: Arc<FileDurableLog>,
    cancel_token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
    _data_dir: TempDir,
}

impl Aggregator {
    async fn start(collector: &FakeCollector, transform: Arc<dyn Transform>) -> Self {
        let data_dir = tempfile::tempdir().expect("no temp dir");
        let store = Arc::new(
            JsonConfigStore::load(data_dir.path().join("devices.json"))
                .await
                .expect("failed to load registry"),
        );
        for (device, volume) in [("WAVY001", Some(3)), ("WAVY002", Some(5)), ("WAVY003", None)] {
            store
                .upsert(
                    &DeviceId::new(device).unwrap(),
                    DeviceRecord::new(DeviceStatus::Associated, volume),
                )
                .await
                .expect("failed to seed registry");
        }
        let log = Arc::new(
            FileDurableLog::new(data_dir.path().join("mirror"))
                .await
                .expect("failed to create mirror dir"),
        );

        let upstream = select_upstream(&[collector.address.clone()], Duration::from_secs(1))
            .await
            .expect("no upstream");

        let cancel_token = CancellationToken::new();
        let node = AggregatorNode::bind(
            &NodeConfig {
                host: "127.0.0.1".to_string(),
                ports: vec![0],
                advertise_address: Some("aggregator-test:5001".to_string()),
                idle_timeout: Duration::from_secs(5),
                collaborator_timeout: Duration::from_secs(2),
            },
            Collaborators {
                config_store: store.clone(),
                durable_log: log.clone(),
                transform,
                forwarder: Arc::new(TcpCollector::new(upstream)),
            },
            cancel_token.clone(),
        )
        .await
        .expect("failed to bind aggregator");
        let addr = node.local_addrs()[0];
        let handle = tokio::spawn(node.spin());

        Aggregator {
            addr,
            store,
            log,
            cancel_token,
            handle,
            _data_dir: data_dir,
        }
    }

    async fn connect(&self) -> Device {
        Device {
            stream: BufReader::new(TcpStream::connect(self.addr).await.expect("connect failed")),
        }
    }

    async fn stop(self) {
        self.cancel_token.cancel();
        self.handle.await.expect("aggregator task failed");
    }
}

struct Device {
    stream: BufReader<TcpStream>,
}

impl Device {
    async fn send(&mut self, line: &str) -> String {
        self.stream
            .get_mut()
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("write failed");
        let mut reply = String::new();
        tokio::time::timeout(Duration::from_secs(3), self.stream.read_line(&mut reply))
            .await
            .expect("reply timed out")
            .expect("read failed");
        reply.trim_end().to_string()
    }

    async fn closed(&mut self) -> bool {
        let mut rest = String::new();
        matches!(
            tokio::time::timeout(Duration::from_secs(3), self.stream.read_line(&mut rest)).await,
            Ok(Ok(0))
        )
    }
}

fn id(s: &str) -> DeviceId {
    DeviceId::new(s).unwrap()
}

#[tokio::test]
async fn handshake_marks_device_operating() {
    let collector = FakeCollector::start().await;
    let aggregator = Aggregator::start(&collector, Arc::new(CsvNormalizer)).await;

    let mut device = aggregator.connect().await;
    assert_eq!(device.send("HELLO:WAVY001").await, "ACK:aggregator-test:5001");
    assert_eq!(
        aggregator.store.get_status(&id("WAVY001")).await,
        Some(DeviceStatus::Operating)
    );

    aggregator.stop().await;
}

#[tokio::test]
async fn unknown_device_is_denied_and_disconnected() {
    let collector = FakeCollector::start().await;
    let aggregator = Aggregator::start(&collector, Arc::new(CsvNormalizer)).await;

    let mut device = aggregator.connect().await;
    assert_eq!(device.send("HELLO:GHOST").await, "DENIED");
    assert!(device.closed().await);

    // the identity is still free for a legitimate device
    let mut device = aggregator.connect().await;
    assert!(device.send("HELLO:WAVY001").await.starts_with("ACK:"));

    aggregator.stop().await;
}

#[tokio::test]
async fn volume_reached_forwards_batch_and_truncates_mirror() {
    let collector = FakeCollector::start().await;
    let aggregator = Aggregator::start(&collector, Arc::new(CsvNormalizer)).await;

    let mut device = aggregator.connect().await;
    device.send("HELLO:WAVY001").await;
    assert_eq!(device.send("DATA_CSV:WAVY001:10:00:00, 1.5 ,a").await, "ACK");
    assert_eq!(device.send("DATA_CSV:WAVY001:10:00:01,1.6,b").await, "ACK");
    assert_eq!(
        aggregator.log.load(&id("WAVY001")).await.unwrap().len(),
        2
    );
    assert!(collector.frames().is_empty());

    assert_eq!(device.send("DATA_CSV:WAVY001:10:00:02,1.7,c").await, "ACK");
    assert_eq!(
        collector.frames(),
        vec!["DATA_CSV:WAVY001:10:00:00,1.5,a\n10:00:01,1.6,b\n10:00:02,1.7,c"]
    );
    assert!(aggregator.log.load(&id("WAVY001")).await.unwrap().is_empty());

    aggregator.stop().await;
}

#[tokio::test]
async fn rejected_forward_keeps_lines_for_retry() {
    let collector = FakeCollector::start().await;
    collector.set_accepting(false);
    let aggregator = Aggregator::start(&collector, Arc::new(CsvNormalizer)).await;

    let mut device = aggregator.connect().await;
    device.send("HELLO:WAVY001").await;
    for n in 1..=3 {
        assert_eq!(device.send(&format!("DATA_CSV:WAVY001:{n}")).await, "ACK");
    }
    assert_eq!(aggregator.log.load(&id("WAVY001")).await.unwrap().len(), 3);

    assert_eq!(device.send("DATA_CSV:WAVY001:4").await, "ACK");
    assert_eq!(
        aggregator.log.load(&id("WAVY001")).await.unwrap(),
        vec!["1", "2", "3", "4"]
    );

    collector.set_accepting(true);
    assert_eq!(device.send("DATA_CSV:WAVY001:5").await, "ACK");
    assert_eq!(collector.frames(), vec!["DATA_CSV:WAVY001:1\n2\n3\n4\n5"]);

    aggregator.stop().await;
}

#[tokio::test]
async fn quit_flushes_below_threshold() {
    let collector = FakeCollector::start().await;
    let aggregator = Aggregator::start(&collector, Arc::new(CsvNormalizer)).await;

    let mut device = aggregator.connect().await;
    device.send("HELLO:WAVY002").await;
    device.send("DATA_CSV:WAVY002:1,x").await;
    device.send("DATA_CSV:WAVY002:2,y").await;
    assert_eq!(device.send("QUIT").await, "BYE");
    assert!(device.closed().await);

    assert_eq!(collector.frames(), vec!["DATA_CSV:WAVY002:1,x\n2,y"]);
    assert_eq!(
        aggregator.store.get_status(&id("WAVY002")).await,
        Some(DeviceStatus::Deactivated)
    );

    // the device may come back once its session is gone
    let mut device = aggregator.connect().await;
    assert!(device.send("HELLO:WAVY002").await.starts_with("ACK:"));

    aggregator.stop().await;
}

#[tokio::test]
async fn transform_service_failure_retains_buffer() {
    let mut transform_server = Server::new_async().await;
    let failing = transform_server
        .mock("POST", "/transform")
        .with_status(500)
        .expect(1)
        .create_async()
        .await;

    let collector = FakeCollector::start().await;
    let transform = HttpTransform::new(
        format!("{}/transform", transform_server.url()),
        Duration::from_secs(2),
    )
    .expect("failed to build transform client");
    let aggregator = Aggregator::start(&collector, Arc::new(transform)).await;

    let mut device = aggregator.connect().await;
    device.send("HELLO:WAVY001").await;
    for n in 1..=3 {
        assert_eq!(device.send(&format!("DATA_CSV:WAVY001:{n}")).await, "ACK");
    }
    failing.assert_async().await;
    assert!(collector.frames().is_empty());
    assert_eq!(
        aggregator.log.load(&id("WAVY001")).await.unwrap(),
        vec!["1", "2", "3"]
    );

    failing.remove_async().await;
    let _converted = transform_server
        .mock("POST", "/transform")
        .match_body("1\n2\n3\n4")
        .with_status(200)
        .with_body("converted")
        .create_async()
        .await;
    assert_eq!(device.send("DATA_CSV:WAVY001:4").await, "ACK");
    assert_eq!(collector.frames(), vec!["DATA_CSV:WAVY001:converted"]);

    aggregator.stop().await;
}

#[tokio::test]
async fn device_without_volume_flushes_on_shutdown() {
    let collector = FakeCollector::start().await;
    let aggregator = Aggregator::start(&collector, Arc::new(CsvNormalizer)).await;

    let mut device = aggregator.connect().await;
    device.send("HELLO:WAVY003").await;
    for n in 1..=10 {
        device.send(&format!("DATA_CSV:WAVY003:{n}")).await;
    }
    assert!(collector.frames().is_empty());

    aggregator.stop().await;
    assert_eq!(collector.frames().len(), 1);
    assert!(collector.frames()[0].starts_with("DATA_CSV:WAVY003:1\n2\n"));
}

//! End-to-end coverage of spec.md §8 scenario 1 ("simple batch") driven
//! through a real TCP socket against a fully wired [`ReceiverApp`].

use std::time::Duration;

use concat_core::ReceiverConfig;
use concat_protocol::FieldValue;
use receiver::ReceiverApp;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

async fn connect_with_retry(addr: &str) -> TcpStream {
    for _ in 0..50 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("could not connect to {addr} after retrying");
}

#[tokio::test]
async fn simple_batch_reaches_the_producer_via_the_dispatcher() {
    let mut config = ReceiverConfig::default();
    config.addr = "127.0.0.1:18911".to_owned();
    config.n_fork_concat = 1;

    let cancel = CancellationToken::new();
    let app = ReceiverApp::build(config, cancel.clone());
    let metrics = app.metrics.clone();
    let dispatcher = app.dispatcher.clone();
    let handles = app.spawn();

    let mut client = connect_with_retry("127.0.0.1:18911").await;
    let bytes = concat_test_utils::batch::array_batch(
        "app.log",
        &[(
            0,
            &[
                ("log", FieldValue::String("hello".to_owned())),
                ("container_id", FieldValue::String("c1".to_owned())),
            ],
        )],
    );
    client.write_all(&bytes).await.unwrap();
    client.shutdown().await.unwrap();

    for _ in 0..100 {
        if dispatcher.has_tag("app.log") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(dispatcher.has_tag("app.log"), "dispatcher never saw tag app.log");

    for _ in 0..50 {
        if metrics.snapshot().get("app.log.msgTotal").copied().unwrap_or(0) >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.get("app.log.msgTotal").copied(), Some(1));

    cancel.cancel();
    for handle in handles {
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }
}

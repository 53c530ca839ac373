//! Receive loop: binds the TCP listener, accepts connections, and spawns
//! one decoder task per connection.

use std::sync::Arc;
use std::time::Duration;

use concat_protocol::{BatchDecoder, FieldValue, Record};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::downstream::Downstream;
use crate::pool::RecordPool;
use crate::router::{Route, Router};

const BIND_RETRY_DELAY: Duration = Duration::from_secs(1);
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct ReceiveLoop {
    addr: String,
    tag_key: String,
    router: Arc<Router>,
    shard_senders: Vec<mpsc::Sender<Record>>,
    downstream: Arc<Downstream>,
    pool: Arc<RecordPool>,
}

impl ReceiveLoop {
    pub fn new(
        addr: String,
        tag_key: String,
        router: Arc<Router>,
        shard_senders: Vec<mpsc::Sender<Record>>,
        downstream: Arc<Downstream>,
        pool: Arc<RecordPool>,
    ) -> Self {
        ReceiveLoop {
            addr,
            tag_key,
            router,
            shard_senders,
            downstream,
            pool,
        }
    }

    /// Bind, accept, retry. Runs until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let listener = match TcpListener::bind(&self.addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(addr = %self.addr, error = %e, "receive: bind failed, retrying");
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(BIND_RETRY_DELAY) => continue,
                    }
                }
            };
            info!(addr = %self.addr, "receive: listening");

            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let conn_cancel = cancel.child_token();
                                let this = self.clone();
                                tokio::spawn(async move {
                                    this.handle_connection(stream, peer, conn_cancel).await;
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "receive: accept failed, closing listener and retrying");
                                tokio::select! {
                                    () = cancel.cancelled() => return,
                                    () = tokio::time::sleep(ACCEPT_RETRY_DELAY) => break,
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: std::net::SocketAddr,
        cancel: CancellationToken,
    ) {
        let mut decoder = BatchDecoder::new(stream);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!(%peer, "receive: connection cancelled");
                    return;
                }
                result = decoder.next_records() => {
                    match result {
                        Ok(Some(records)) => {
                            for record in records {
                                self.route_one(record).await;
                            }
                        }
                        Ok(None) => {
                            info!(%peer, "receive: connection closed");
                            return;
                        }
                        Err(err) => {
                            error!(%peer, error = %err, "receive: fatal decode error, closing connection");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn route_one(&self, mut record: Record) {
        record
            .fields
            .insert(self.tag_key.clone(), FieldValue::String(record.tag.clone()));

        match self.router.route(&mut record) {
            Route::Shard(i) => {
                if let Some(sender) = self.shard_senders.get(i) {
                    if sender.send(record).await.is_err() {
                        warn!(shard = i, "receive: shard channel closed, dropping record");
                    }
                }
            }
            Route::Bypass => {
                let _ = self.downstream.send(record).await;
            }
            Route::Dropped => {
                self.pool.recycle(record);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concat_protocol::FieldMap;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn route_one_bypasses_to_downstream_without_lb_key() {
        let router = Arc::new(Router::new("container_id".to_owned(), 4, None));
        let (dtx, mut drx) = mpsc::channel(8);
        let downstream = Arc::new(Downstream::new(dtx));
        let receive = ReceiveLoop::new(
            "127.0.0.1:0".to_owned(),
            "tag".to_owned(),
            router,
            vec![],
            downstream,
            Arc::new(RecordPool::new(8)),
        );

        receive
            .route_one(Record::new("app.log".to_owned(), FieldMap::new()))
            .await;

        let out = drx.recv().await.unwrap();
        assert_eq!(out.fields.get("tag"), Some(&FieldValue::String("app.log".to_owned())));
    }

    #[tokio::test]
    async fn accepts_connection_and_closes_on_eof() {
        let router = Arc::new(Router::new("container_id".to_owned(), 1, None));
        let (shard_tx, mut shard_rx) = mpsc::channel(8);
        let (dtx, _drx) = mpsc::channel(8);
        let downstream = Arc::new(Downstream::new(dtx));
        let receive = Arc::new(ReceiveLoop::new(
            "127.0.0.1:0".to_owned(),
            "tag".to_owned(),
            router,
            vec![shard_tx],
            downstream,
            Arc::new(RecordPool::new(8)),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let conn_cancel = cancel.child_token();
        let receive_for_task = receive.clone();
        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            receive_for_task.handle_connection(stream, peer, conn_cancel).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let frame = rmpv::Value::Array(vec![
            rmpv::Value::from("app.log"),
            rmpv::Value::Array(vec![rmpv::Value::Array(vec![
                rmpv::Value::from(0i64),
                rmpv::Value::Map(vec![(rmpv::Value::from("log"), rmpv::Value::from("hi"))]),
            ])]),
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &frame).unwrap();
        client.write_all(&buf).await.unwrap();
        client.shutdown().await.unwrap();

        let routed = shard_rx.recv().await.unwrap();
        assert_eq!(routed.tag, "app.log");
    }

    #[tokio::test]
    async fn accepts_length_3_single_map_frame() {
        use concat_protocol::FieldValue;

        let router = Arc::new(Router::new("container_id".to_owned(), 1, None));
        let (shard_tx, mut shard_rx) = mpsc::channel(8);
        let (dtx, _drx) = mpsc::channel(8);
        let downstream = Arc::new(Downstream::new(dtx));
        let receive = Arc::new(ReceiveLoop::new(
            "127.0.0.1:0".to_owned(),
            "tag".to_owned(),
            router,
            vec![shard_tx],
            downstream,
            Arc::new(RecordPool::new(8)),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let conn_cancel = cancel.child_token();
        let receive_for_task = receive.clone();
        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            receive_for_task.handle_connection(stream, peer, conn_cancel).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let buf = concat_test_utils::batch::single_map_frame(
            "app.log",
            0,
            &[("log", FieldValue::String("hi".to_owned()))],
        );
        client.write_all(&buf).await.unwrap();
        client.shutdown().await.unwrap();

        let routed = shard_rx.recv().await.unwrap();
        assert_eq!(routed.tag, "app.log");
        assert_eq!(routed.fields.get("log"), Some(&FieldValue::String("hi".to_owned())));
    }
}

//! 本地 gun gRPC 服务端测试

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::{Channel, Server};
use tonic::Code;

use common::grpc::{GunConn, GunServiceClient, Hunk, TunStream};
use outbound::{Conn, ConnHandler, GunServer};

/// 以固定大小的缓冲区回显，直到流结束
struct EchoHandler {
    buf_size: usize,
}

#[async_trait]
impl ConnHandler for EchoHandler {
    async fn handle(&self, conn: GunConn<TunStream>) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.buf_size];
        loop {
            match conn.read(&mut buf).await {
                Ok(n) => {
                    conn.write(&buf[..n]).await?;
                }
                Err(e) if e.is_eof() => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// 读一条消息后报错
struct FailingHandler;

#[async_trait]
impl ConnHandler for FailingHandler {
    async fn handle(&self, conn: GunConn<TunStream>) -> anyhow::Result<()> {
        let mut buf = [0u8; 64];
        conn.read(&mut buf).await?;
        Err(anyhow!("upstream refused"))
    }
}

/// 把连接的对端地址报告出来
struct AddrHandler {
    report: mpsc::UnboundedSender<(Option<SocketAddr>, Option<SocketAddr>)>,
}

#[async_trait]
impl ConnHandler for AddrHandler {
    async fn handle(&self, conn: GunConn<TunStream>) -> anyhow::Result<()> {
        let _ = self.report.send((conn.local_addr(), conn.remote_addr()));
        Ok(())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn start<H: ConnHandler>(handler: H) -> (SocketAddr, GunServiceClient<Channel>) {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = GunServer::new(Some(addr), handler);
    tokio::spawn(async move {
        Server::builder()
            .add_service(server.into_service())
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    let client = GunServiceClient::connect(format!("http://{}", addr))
        .await
        .unwrap();
    (addr, client)
}

fn hunk(data: &'static [u8]) -> Hunk {
    Hunk {
        data: Bytes::from_static(data),
    }
}

#[tokio::test]
async fn test_echo_splits_large_message() {
    let (_addr, mut client) = start(EchoHandler { buf_size: 4 }).await;

    let (tx, rx) = mpsc::channel(16);
    let mut inbound = client
        .tun(ReceiverStream::new(rx))
        .await
        .unwrap()
        .into_inner();

    tx.send(hunk(b"hello world")).await.unwrap();
    let mut echoed = Vec::new();
    let mut messages = 0;
    while echoed.len() < 11 {
        let msg = tokio::time::timeout(Duration::from_secs(5), inbound.message())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        echoed.extend_from_slice(&msg.data);
        messages += 1;
    }
    assert_eq!(echoed, b"hello world");
    // 4 字节缓冲区需要 3 次读取
    assert_eq!(messages, 3);

    drop(tx);
    let end = tokio::time::timeout(Duration::from_secs(5), inbound.message())
        .await
        .unwrap()
        .unwrap();
    assert!(end.is_none());
}

#[tokio::test]
async fn test_handler_error_becomes_internal_status() {
    let (_addr, mut client) = start(FailingHandler).await;

    let (tx, rx) = mpsc::channel(16);
    let mut inbound = client
        .tun(ReceiverStream::new(rx))
        .await
        .unwrap()
        .into_inner();
    tx.send(hunk(b"request")).await.unwrap();

    let status = tokio::time::timeout(Duration::from_secs(5), inbound.message())
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(status.code(), Code::Internal);
    assert!(status.message().contains("upstream refused"));
}

#[tokio::test]
async fn test_connection_addresses() {
    let (report_tx, mut report_rx) = mpsc::unbounded_channel();
    let (addr, mut client) = start(AddrHandler { report: report_tx }).await;

    let (_tx, rx) = mpsc::channel::<Hunk>(1);
    let _inbound = client.tun(ReceiverStream::new(rx)).await.unwrap();

    let (local, remote) = tokio::time::timeout(Duration::from_secs(5), report_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(local, Some(addr));
    assert!(remote.unwrap().ip().is_loopback());
}

#[tokio::test]
async fn test_tun_datagram_completes_immediately() {
    let (_addr, mut client) = start(EchoHandler { buf_size: 16 }).await;

    let (_tx, rx) = mpsc::channel::<Hunk>(1);
    let mut inbound = client
        .tun_datagram(ReceiverStream::new(rx))
        .await
        .unwrap()
        .into_inner();
    let end = tokio::time::timeout(Duration::from_secs(5), inbound.message())
        .await
        .unwrap()
        .unwrap();
    assert!(end.is_none());
}

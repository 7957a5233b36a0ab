//! gun gRPC 隧道服务端
//!
//! 每个入站 `Tun` 调用被包装成一个 [`GunConn`]，交给外部提供的 [`ConnHandler`] 处理，
//! 调用的生命周期与处理函数相同。`TunDatagram` 只被接受，立即结束。

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, info, warn};

use common::grpc::{GunConn, GunService, GunServiceServer, Hunk, TunStream};

/// 每个调用的响应通道容量
const RESPONSE_CHANNEL_SIZE: usize = 64;

/// 隧道连接处理器
#[async_trait]
pub trait ConnHandler: Send + Sync + 'static {
    /// 处理一条隧道连接，返回时对应的 RPC 调用结束
    ///
    /// 返回错误时调用方会收到 `Internal` 状态。
    async fn handle(&self, conn: GunConn<TunStream>) -> anyhow::Result<()>;
}

type ResponseStream = Pin<Box<dyn Stream<Item = Result<Hunk, Status>> + Send>>;

/// `gun.GunService` 服务实现
pub struct GunServer<H> {
    local_addr: Option<SocketAddr>,
    handler: Arc<H>,
}

impl<H: ConnHandler> GunServer<H> {
    /// 创建服务
    ///
    /// # Arguments
    /// * `local_addr` - 监听地址，作为连接的本地地址
    /// * `handler` - 连接处理器
    pub fn new(local_addr: Option<SocketAddr>, handler: H) -> Self {
        Self {
            local_addr,
            handler: Arc::new(handler),
        }
    }

    pub fn into_service(self) -> GunServiceServer<Self> {
        GunServiceServer::new(self)
    }

    /// 在 `addr` 上启动 gRPC 服务，直到出错才返回
    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        info!("gun gRPC 服务启动: {}", addr);
        if let Err(e) = Server::builder()
            .add_service(self.into_service())
            .serve(addr)
            .await
        {
            error!("gun gRPC 服务错误: {}", e);
            return Err(e.into());
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl<H: ConnHandler> GunService for GunServer<H> {
    type TunStream = ResponseStream;
    type TunDatagramStream = ResponseStream;

    async fn tun(
        &self,
        request: Request<Streaming<Hunk>>,
    ) -> Result<Response<Self::TunStream>, Status> {
        let remote_addr = request.remote_addr();
        let inbound = request.into_inner();

        // 连接写入 outbound，转发任务把它搬到响应流；处理器返回后转发任务结束，响应流随之关闭
        let (out_tx, mut out_rx) = mpsc::channel(RESPONSE_CHANNEL_SIZE);
        let (resp_tx, resp_rx) = mpsc::channel(RESPONSE_CHANNEL_SIZE);
        let done = CancellationToken::new();

        let conn = GunConn::new(TunStream::new(inbound, out_tx.clone(), remote_addr), self.local_addr);
        let handler = self.handler.clone();
        let handler_done = done.clone();
        tokio::spawn(async move {
            debug!("新的 gun 隧道连接: {:?}", remote_addr);
            if let Err(e) = handler.handle(conn).await {
                warn!("gun 隧道处理失败 ({:?}): {}", remote_addr, e);
                let _ = out_tx.send(Err(Status::internal(e.to_string()))).await;
            }
            handler_done.cancel();
        });

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    msg = out_rx.recv() => match msg {
                        Some(msg) => {
                            if resp_tx.send(msg).await.is_err() {
                                return;
                            }
                        }
                        None => return,
                    },
                    _ = done.cancelled() => break,
                }
            }
            // 处理器已返回，送出剩余消息后结束
            while let Ok(msg) = out_rx.try_recv() {
                if resp_tx.send(msg).await.is_err() {
                    return;
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(resp_rx))))
    }

    async fn tun_datagram(
        &self,
        _request: Request<Streaming<Hunk>>,
    ) -> Result<Response<Self::TunDatagramStream>, Status> {
        Ok(Response::new(Box::pin(tokio_stream::empty::<Result<Hunk, Status>>())))
    }
}

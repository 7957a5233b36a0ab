//! 生成 gun 隧道的 gRPC 服务代码
//!
//! `Hunk` 消息在 `src/grpc/mod.rs` 中手写（prost 派生），这里只生成服务端/客户端桩代码，
//! 因此构建时不需要 protoc。

fn main() {
    let tun = tonic_build::manual::Method::builder()
        .name("tun")
        .route_name("Tun")
        .input_type("crate::grpc::Hunk")
        .output_type("crate::grpc::Hunk")
        .codec_path("tonic::codec::ProstCodec")
        .client_streaming()
        .server_streaming()
        .build();

    let tun_datagram = tonic_build::manual::Method::builder()
        .name("tun_datagram")
        .route_name("TunDatagram")
        .input_type("crate::grpc::Hunk")
        .output_type("crate::grpc::Hunk")
        .codec_path("tonic::codec::ProstCodec")
        .client_streaming()
        .server_streaming()
        .build();

    let service = tonic_build::manual::Service::builder()
        .name("GunService")
        .package("gun")
        .method(tun)
        .method(tun_datagram)
        .build();

    tonic_build::manual::Builder::new().compile(&[service]);
}

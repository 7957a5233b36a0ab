//! hysteria2 线路协议
//!
//! - 认证：一次 HTTP/3 `POST https://hysteria/auth`，信息都放在请求/响应头中；
//! - TCP 请求：每个隧道请求独占一个双向 QUIC 流，客户端写请求帧，服务端回应答帧；
//! - UDP 消息：每个 QUIC 数据报承载一个（分片后的）UDP 消息。
//!
//! 变长整数使用 QUIC varint 编码（RFC 9000 §16）。

use bytes::{Buf, BufMut, Bytes};
use http::HeaderMap;
use rand::distr::Alphanumeric;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use common::{Error, Result};

pub const URL_HOST: &str = "hysteria";
pub const URL_PATH: &str = "/auth";

// HTTP/3 要求头名全小写（对应 Hysteria-Auth、Hysteria-UDP 等）
pub const HEADER_AUTH: &str = "hysteria-auth";
pub const HEADER_UDP_ENABLED: &str = "hysteria-udp";
pub const HEADER_CC_RX: &str = "hysteria-cc-rx";
pub const HEADER_PADDING: &str = "hysteria-padding";

/// 认证成功的状态码
pub const STATUS_AUTH_OK: u16 = 233;

pub const FRAME_TYPE_TCP_REQUEST: u64 = 0x401;

pub const MAX_ADDRESS_LENGTH: usize = 2048;
pub const MAX_MESSAGE_LENGTH: usize = 2048;
pub const MAX_PADDING_LENGTH: usize = 4096;

/// 一个 QUIC 数据报帧的最大长度，也是 UDP 会话发送缓冲区的大小
pub const MAX_DATAGRAM_FRAME_SIZE: usize = 1200;

const MAX_VARINT: u64 = (1 << 62) - 1;

/// 随机填充长度范围
#[derive(Debug, Clone, Copy)]
struct Padding {
    min: usize,
    max: usize,
}

impl Padding {
    fn generate(&self) -> String {
        let mut rng = rand::rng();
        let len = rng.random_range(self.min..self.max);
        (&mut rng)
            .sample_iter(Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }
}

const AUTH_REQUEST_PADDING: Padding = Padding { min: 256, max: 2048 };
const TCP_REQUEST_PADDING: Padding = Padding { min: 64, max: 512 };
const TCP_RESPONSE_PADDING: Padding = Padding { min: 128, max: 1024 };

// ---------------------------------------------------------------------------
// 认证
// ---------------------------------------------------------------------------

/// 客户端认证请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub auth: String,
    /// 客户端最大接收速率（字节/秒），0 表示未知
    pub rx: u64,
}

/// 服务端认证响应
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthResponse {
    pub udp_enabled: bool,
    /// 服务端最大接收速率（字节/秒），0 表示不限
    pub rx: u64,
    /// 服务端要求客户端使用带宽探测（BBR）
    pub rx_auto: bool,
}

/// 把认证请求写入请求头
pub fn auth_request_to_headers(headers: &mut HeaderMap, req: &AuthRequest) -> Result<()> {
    headers.insert(HEADER_AUTH, header_value(&req.auth)?);
    headers.insert(HEADER_CC_RX, header_value(&req.rx.to_string())?);
    headers.insert(HEADER_PADDING, header_value(&AUTH_REQUEST_PADDING.generate())?);
    Ok(())
}

/// 从响应头解析认证响应，缺失或格式不对的字段取零值
pub fn auth_response_from_headers(headers: &HeaderMap) -> AuthResponse {
    let mut resp = AuthResponse {
        udp_enabled: parse_bool(header_str(headers, HEADER_UDP_ENABLED)),
        ..Default::default()
    };
    match header_str(headers, HEADER_CC_RX) {
        "auto" => resp.rx_auto = true,
        rx => resp.rx = rx.parse().unwrap_or(0),
    }
    resp
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
}

fn header_value(value: &str) -> Result<http::HeaderValue> {
    http::HeaderValue::from_str(value)
        .map_err(|e| Error::Protocol(format!("invalid header value: {e}")))
}

fn parse_bool(s: &str) -> bool {
    matches!(s, "1" | "t" | "T" | "true" | "TRUE" | "True")
}

// ---------------------------------------------------------------------------
// varint
// ---------------------------------------------------------------------------

pub fn varint_len(value: u64) -> usize {
    if value < (1 << 6) {
        1
    } else if value < (1 << 14) {
        2
    } else if value < (1 << 30) {
        4
    } else {
        8
    }
}

pub fn put_varint<B: BufMut>(buf: &mut B, value: u64) {
    debug_assert!(value <= MAX_VARINT);
    match varint_len(value) {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16(0x4000 | value as u16),
        4 => buf.put_u32(0x8000_0000 | value as u32),
        _ => buf.put_u64(0xc000_0000_0000_0000 | value),
    }
}

/// 从内存缓冲区读取 varint，数据不足时返回 `None`
pub fn get_varint<B: Buf>(buf: &mut B) -> Option<u64> {
    if !buf.has_remaining() {
        return None;
    }
    let first = buf.chunk()[0];
    let len = 1usize << (first >> 6);
    if buf.remaining() < len {
        return None;
    }
    let value = match len {
        1 => u64::from(buf.get_u8()),
        2 => u64::from(buf.get_u16() & 0x3fff),
        4 => u64::from(buf.get_u32() & 0x3fff_ffff),
        _ => buf.get_u64() & MAX_VARINT,
    };
    Some(value)
}

/// 从流中读取 varint
pub async fn read_varint<R: AsyncRead + Unpin>(r: &mut R) -> Result<u64> {
    let first = r.read_u8().await?;
    let len = 1usize << (first >> 6);
    let mut value = u64::from(first & 0x3f);
    for _ in 1..len {
        value = (value << 8) | u64::from(r.read_u8().await?);
    }
    Ok(value)
}

async fn discard<R: AsyncRead + Unpin>(r: &mut R, len: u64) -> Result<()> {
    let mut limited = AsyncReadExt::take(r, len);
    let copied = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
    if copied < len {
        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// TCP 请求 / 应答
// ---------------------------------------------------------------------------

/// 写入 TCP 请求帧
///
/// ```text
/// [varint] 0x401
/// [varint] 地址长度
/// [bytes]  地址 (host:port)
/// [varint] 填充长度
/// [bytes]  随机填充
/// ```
pub async fn write_tcp_request<W: AsyncWrite + Unpin>(w: &mut W, addr: &str) -> Result<()> {
    if addr.is_empty() || addr.len() > MAX_ADDRESS_LENGTH {
        return Err(Error::Protocol("invalid address length".to_string()));
    }
    let padding = TCP_REQUEST_PADDING.generate();
    let mut buf = Vec::with_capacity(
        varint_len(FRAME_TYPE_TCP_REQUEST)
            + varint_len(addr.len() as u64)
            + addr.len()
            + varint_len(padding.len() as u64)
            + padding.len(),
    );
    put_varint(&mut buf, FRAME_TYPE_TCP_REQUEST);
    put_varint(&mut buf, addr.len() as u64);
    buf.put_slice(addr.as_bytes());
    put_varint(&mut buf, padding.len() as u64);
    buf.put_slice(padding.as_bytes());
    w.write_all(&buf).await?;
    Ok(())
}

/// 读取 TCP 请求帧，返回目标地址（服务端使用）
pub async fn read_tcp_request<R: AsyncRead + Unpin>(r: &mut R) -> Result<String> {
    let frame_type = read_varint(r).await?;
    if frame_type != FRAME_TYPE_TCP_REQUEST {
        return Err(Error::Protocol(format!("unexpected frame type: {frame_type:#x}")));
    }
    let addr_len = read_varint(r).await?;
    if addr_len == 0 || addr_len > MAX_ADDRESS_LENGTH as u64 {
        return Err(Error::Protocol("invalid address length".to_string()));
    }
    let mut addr = vec![0u8; addr_len as usize];
    r.read_exact(&mut addr).await?;
    let padding_len = read_varint(r).await?;
    if padding_len > MAX_PADDING_LENGTH as u64 {
        return Err(Error::Protocol("invalid padding length".to_string()));
    }
    discard(r, padding_len).await?;
    String::from_utf8(addr).map_err(|_| Error::Protocol("address is not utf-8".to_string()))
}

/// 写入 TCP 应答帧（服务端使用）
pub async fn write_tcp_response<W: AsyncWrite + Unpin>(w: &mut W, ok: bool, msg: &str) -> Result<()> {
    let msg = &msg.as_bytes()[..msg.len().min(MAX_MESSAGE_LENGTH)];
    let padding = TCP_RESPONSE_PADDING.generate();
    let mut buf = Vec::with_capacity(1 + 8 + msg.len() + 8 + padding.len());
    buf.put_u8(if ok { 0x00 } else { 0x01 });
    put_varint(&mut buf, msg.len() as u64);
    buf.put_slice(msg);
    put_varint(&mut buf, padding.len() as u64);
    buf.put_slice(padding.as_bytes());
    w.write_all(&buf).await?;
    Ok(())
}

/// 读取 TCP 应答帧
///
/// ```text
/// [uint8]  状态 (0x00 = 成功, 其他 = 失败)
/// [varint] 消息长度
/// [bytes]  消息
/// [varint] 填充长度
/// [bytes]  随机填充
/// ```
///
/// # Returns
/// `(是否成功, 服务端消息)`
pub async fn read_tcp_response<R: AsyncRead + Unpin>(r: &mut R) -> Result<(bool, String)> {
    let status = r.read_u8().await?;
    let msg_len = read_varint(r).await?;
    if msg_len > MAX_MESSAGE_LENGTH as u64 {
        return Err(Error::Protocol("invalid message length".to_string()));
    }
    let mut msg = vec![0u8; msg_len as usize];
    r.read_exact(&mut msg).await?;
    let padding_len = read_varint(r).await?;
    if padding_len > MAX_PADDING_LENGTH as u64 {
        return Err(Error::Protocol("invalid padding length".to_string()));
    }
    discard(r, padding_len).await?;
    Ok((status == 0x00, String::from_utf8_lossy(&msg).into_owned()))
}

// ---------------------------------------------------------------------------
// UDP 消息
// ---------------------------------------------------------------------------

/// UDP 消息
///
/// ```text
/// [uint32] 会话 ID
/// [uint16] 包 ID
/// [uint8]  分片 ID
/// [uint8]  分片数
/// [varint] 地址长度
/// [bytes]  地址 (host:port)
/// [bytes]  负载
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpMessage {
    pub session_id: u32,
    pub packet_id: u16,
    pub frag_id: u8,
    pub frag_count: u8,
    pub addr: String,
    pub data: Bytes,
}

impl UdpMessage {
    pub fn header_size(&self) -> usize {
        4 + 2 + 1 + 1 + varint_len(self.addr.len() as u64) + self.addr.len()
    }

    pub fn size(&self) -> usize {
        self.header_size() + self.data.len()
    }

    /// 序列化到调用方提供的缓冲区
    ///
    /// 放不下时返回 `None`，调用方应静默丢弃该消息。
    pub fn serialize(&self, buf: &mut [u8]) -> Option<usize> {
        let size = self.size();
        if buf.len() < size {
            return None;
        }
        let mut w = &mut buf[..size];
        w.put_u32(self.session_id);
        w.put_u16(self.packet_id);
        w.put_u8(self.frag_id);
        w.put_u8(self.frag_count);
        put_varint(&mut w, self.addr.len() as u64);
        w.put_slice(self.addr.as_bytes());
        w.put_slice(&self.data);
        Some(size)
    }
}

/// 解析一个 UDP 消息，负载与 `msg` 共享内存
pub fn parse_udp_message(mut msg: Bytes) -> Result<UdpMessage> {
    if msg.remaining() < 8 {
        return Err(Error::Protocol("udp message too short".to_string()));
    }
    let session_id = msg.get_u32();
    let packet_id = msg.get_u16();
    let frag_id = msg.get_u8();
    let frag_count = msg.get_u8();
    let addr_len = get_varint(&mut msg)
        .ok_or_else(|| Error::Protocol("udp message too short".to_string()))?;
    if addr_len == 0 || addr_len > MAX_MESSAGE_LENGTH as u64 {
        return Err(Error::Protocol("invalid address length".to_string()));
    }
    let addr_len = addr_len as usize;
    // 地址之后至少要有一个字节的负载
    if msg.len() <= addr_len {
        return Err(Error::Protocol("invalid message length".to_string()));
    }
    let addr = msg.split_to(addr_len);
    let addr = String::from_utf8(addr.to_vec())
        .map_err(|_| Error::Protocol("address is not utf-8".to_string()))?;
    Ok(UdpMessage {
        session_id,
        packet_id,
        frag_id,
        frag_count,
        addr,
        data: msg,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_encoding() {
        let cases: &[(u64, &[u8])] = &[
            (0, &[0x00]),
            (37, &[0x25]),
            (15293, &[0x7b, 0xbd]),
            (494878333, &[0x9d, 0x7f, 0x3e, 0x7d]),
            (151288809941952652, &[0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c]),
        ];
        for (value, encoded) in cases {
            let mut buf = Vec::new();
            put_varint(&mut buf, *value);
            assert_eq!(&buf[..], *encoded, "encode {value}");
            assert_eq!(varint_len(*value), encoded.len());
            assert_eq!(get_varint(&mut &encoded[..]), Some(*value));
        }
        assert_eq!(get_varint(&mut &[0x7b][..]), None);
    }

    #[tokio::test]
    async fn test_read_varint_from_stream() {
        let mut r = &[0x9d, 0x7f, 0x3e, 0x7d, 0x25][..];
        assert_eq!(read_varint(&mut r).await.unwrap(), 494878333);
        assert_eq!(read_varint(&mut r).await.unwrap(), 37);
        assert!(read_varint(&mut r).await.is_err());
    }

    #[test]
    fn test_auth_headers() {
        let mut headers = HeaderMap::new();
        let req = AuthRequest {
            auth: "secret".to_string(),
            rx: 12_500_000,
        };
        auth_request_to_headers(&mut headers, &req).unwrap();
        assert_eq!(headers.get(HEADER_AUTH).unwrap(), "secret");
        assert_eq!(headers.get(HEADER_CC_RX).unwrap(), "12500000");
        let padding = headers.get(HEADER_PADDING).unwrap().len();
        assert!((256..2048).contains(&padding));
    }

    #[test]
    fn test_auth_response_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_UDP_ENABLED, "true".parse().unwrap());
        headers.insert(HEADER_CC_RX, "auto".parse().unwrap());
        let resp = auth_response_from_headers(&headers);
        assert!(resp.udp_enabled);
        assert!(resp.rx_auto);
        assert_eq!(resp.rx, 0);

        let mut headers = HeaderMap::new();
        headers.insert(HEADER_UDP_ENABLED, "false".parse().unwrap());
        headers.insert(HEADER_CC_RX, "3000".parse().unwrap());
        let resp = auth_response_from_headers(&headers);
        assert!(!resp.udp_enabled);
        assert!(!resp.rx_auto);
        assert_eq!(resp.rx, 3000);

        // 缺失或非法的字段取零值
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_CC_RX, "lots".parse().unwrap());
        assert_eq!(auth_response_from_headers(&headers), AuthResponse::default());
    }

    #[tokio::test]
    async fn test_tcp_request_frame() {
        let (mut client, mut server) = tokio::io::duplex(8192);
        write_tcp_request(&mut client, "example.com:443").await.unwrap();
        assert_eq!(read_tcp_request(&mut server).await.unwrap(), "example.com:443");

        let too_long = "a".repeat(MAX_ADDRESS_LENGTH + 1);
        assert!(write_tcp_request(&mut client, &too_long).await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_response_frame() {
        let (mut server, mut client) = tokio::io::duplex(8192);
        write_tcp_response(&mut server, false, "connection refused")
            .await
            .unwrap();
        write_tcp_response(&mut server, true, "").await.unwrap();

        let (ok, msg) = read_tcp_response(&mut client).await.unwrap();
        assert!(!ok);
        assert_eq!(msg, "connection refused");
        let (ok, msg) = read_tcp_response(&mut client).await.unwrap();
        assert!(ok);
        assert!(msg.is_empty());
    }

    #[tokio::test]
    async fn test_tcp_response_rejects_oversized_message() {
        let mut frame = vec![0x01];
        put_varint(&mut frame, MAX_MESSAGE_LENGTH as u64 + 1);
        let mut r = &frame[..];
        assert!(matches!(
            read_tcp_response(&mut r).await,
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_udp_message_serialize() {
        let msg = UdpMessage {
            session_id: 7,
            packet_id: 3,
            frag_id: 0,
            frag_count: 1,
            addr: "1.1.1.1:53".to_string(),
            data: Bytes::from_static(b"query"),
        };
        let mut buf = [0u8; 64];
        let n = msg.serialize(&mut buf).unwrap();
        assert_eq!(n, msg.size());
        assert_eq!(&buf[..8], &[0, 0, 0, 7, 0, 3, 0, 1]);
        assert_eq!(buf[8] as usize, msg.addr.len());

        let parsed = parse_udp_message(Bytes::copy_from_slice(&buf[..n])).unwrap();
        assert_eq!(parsed, msg);

        let mut small = [0u8; 16];
        assert_eq!(msg.serialize(&mut small), None);
    }

    #[test]
    fn test_parse_malformed_udp_message() {
        // 头部不完整
        assert!(parse_udp_message(Bytes::from_static(&[0, 0, 0, 1, 0])).is_err());
        // 地址长度为 0
        assert!(parse_udp_message(Bytes::from_static(&[0, 0, 0, 1, 0, 0, 0, 1, 0, 1])).is_err());
        // 地址之后没有负载
        assert!(parse_udp_message(Bytes::from_static(&[0, 0, 0, 1, 0, 0, 0, 1, 2, b'a', b'b'])).is_err());
    }
}

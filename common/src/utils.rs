use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use socket2::{Socket, Domain, Type, Protocol};

#[cfg(windows)]
fn apply_windows_udp_fix(socket: &Socket) -> io::Result<()> {
    use std::os::windows::io::AsRawSocket;
    use windows_sys::Win32::Networking::WinSock::{WSAIoctl, SIO_UDP_CONNRESET, SOCKET_ERROR};
    use std::ptr;

    let handle = socket.as_raw_socket();
    let mut bytes_returned: u32 = 0;
    let mut enable: u32 = 0; // FALSE

    // 关闭 SIO_UDP_CONNRESET，否则对端不可达时后续 recv 会一直报错
    let ret = unsafe {
        WSAIoctl(
            handle as usize,
            SIO_UDP_CONNRESET,
            &mut enable as *mut _ as *mut _,
            std::mem::size_of::<u32>() as u32,
            ptr::null_mut(),
            0,
            &mut bytes_returned,
            ptr::null_mut(),
            None,
        )
    };

    if ret == SOCKET_ERROR {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// 创建已绑定的非阻塞 UDP socket
pub fn create_configured_udp_socket(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_nonblocking(true)?;

    #[cfg(windows)]
    apply_windows_udp_fix(&socket)?;

    socket.bind(&addr.into())?;

    Ok(socket.into())
}

/// 与远端地址族匹配的通配本地地址（端口由系统分配）
pub fn unspecified_addr_for(remote: SocketAddr) -> SocketAddr {
    if remote.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unspecified_addr_matches_family() {
        let v4: SocketAddr = "1.2.3.4:443".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        assert!(unspecified_addr_for(v4).is_ipv4());
        assert!(unspecified_addr_for(v6).is_ipv6());
        assert_eq!(unspecified_addr_for(v4).port(), 0);
    }

    #[tokio::test]
    async fn test_create_udp_socket() {
        let socket = create_configured_udp_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        let local = socket.local_addr().unwrap();
        assert!(local.ip().is_loopback());
        assert_ne!(local.port(), 0);
    }
}

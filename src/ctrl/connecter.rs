use std::io;
use std::net::*;
use std::time::Duration;

/// Bind the plain-socket listener the responder accepts initiators on.
///
/// Binds every local address on `port`; port 0 picks an ephemeral one.
pub fn open_server_socket(port: u16) -> io::Result<TcpListener> {
    let any = if cfg!(feature = "ipv6") {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    };
    let listener = TcpListener::bind(SocketAddr::new(any, port))?;
    log::debug!("control socket bound to {}", listener.local_addr()?);
    Ok(listener)
}

/// Connect to `host:port`, trying every address the name resolves to.
pub fn open_client_socket(host: &str, port: u16) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => {
                log::debug!("connecting to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} resolves to no address", host),
        )
    }))
}

/// Connect to `server_addr`, retrying every `wait_on_failure` until it
/// succeeds or `attempts` connection attempts failed.
pub fn connect_until_success(
    server_addr: SocketAddr,
    wait_on_failure: Duration,
    attempts: usize,
) -> io::Result<TcpStream> {
    let mut tried = 0;
    loop {
        match TcpStream::connect(server_addr) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                break Ok(stream);
            }
            Err(e) => {
                tried += 1;
                if tried >= attempts {
                    break Err(e);
                }
            }
        }
        std::thread::sleep(wait_on_failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::thread;

    #[test]
    fn test_socket_pair() {
        let listener = open_server_socket(0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let peer = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            buf
        });

        let mut stream = open_client_socket("127.0.0.1", port).unwrap();
        stream.write_all(b"ping").unwrap();
        assert_eq!(&peer.join().unwrap(), b"ping");
    }

    #[test]
    fn test_connect_gives_up() {
        // Grab a free port, then close it again.
        let port = open_server_socket(0).unwrap().local_addr().unwrap().port();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        assert!(connect_until_success(addr, Duration::from_millis(1), 3).is_err());
    }
}

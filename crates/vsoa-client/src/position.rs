//! Service-name to address resolution. Grounded on `vsoa_position.h`: a textual server name is
//! either already a `host:port` pair, or is resolved by querying a position server over UDP with a
//! small bounded request/response exchange.

use std::env;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use vsoa_support::error::{VsoaError, VsoaErrorKind, VsoaResult};

/// Max response size accepted from a position server (keeps the exchange inside one Ethernet MTU).
const MAX_RESPONSE_LEN: usize = 1472;
const QUERY_TIMEOUT: Duration = Duration::from_millis(500);
const ENV_POSITION_SERVER: &str = "VSOA_POS_SERVER";
const POSITION_CONFIG_FILE: &str = "/etc/vsoa.pos";

/// One opcode: plain-text service name query, newline-terminated `host:port` response.
const OPCODE_QUERY: u8 = 0x01;

/// Resolves `server` to a concrete address. An `ip:port` literal is used directly; anything else
/// is treated as a service name and resolved against a configured position server.
pub fn resolve(server: &str) -> VsoaResult<SocketAddr> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    query_position_server(server)
}

/// Order of lookup mirrors `vsoa_position_lookup`: an explicit address (handled by the caller),
/// then the `VSOA_POS_SERVER` environment variable, then the first line of `/etc/vsoa.pos`.
fn position_server_addr() -> VsoaResult<SocketAddr> {
    if let Ok(explicit) = env::var(ENV_POSITION_SERVER) {
        return explicit.trim().parse().map_err(|_| VsoaError::Fatal(VsoaErrorKind::AddrParse));
    }
    if let Ok(contents) = std::fs::read_to_string(POSITION_CONFIG_FILE) {
        if let Some(line) = contents.lines().find(|l| !l.trim().is_empty()) {
            return line.trim().parse().map_err(|_| VsoaError::Fatal(VsoaErrorKind::AddrParse));
        }
    }
    Err(VsoaError::Fatal(VsoaErrorKind::NotFound))
}

fn query_position_server(name: &str) -> VsoaResult<SocketAddr> {
    let pos_addr = position_server_addr()?;

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_read_timeout(Some(QUERY_TIMEOUT))?;

    let mut request = Vec::with_capacity(1 + name.len());
    request.push(OPCODE_QUERY);
    request.extend_from_slice(name.as_bytes());
    socket.send_to(&request, pos_addr)?;

    let mut buf = [0u8; MAX_RESPONSE_LEN];
    let (len, _from) = socket.recv_from(&mut buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => VsoaError::Fatal(VsoaErrorKind::Timeout),
        _ => VsoaError::from(e),
    })?;
    if len == 0 {
        return Err(VsoaError::Fatal(VsoaErrorKind::ProtocolError));
    }

    let body = std::str::from_utf8(&buf[..len]).map_err(|_| VsoaError::Fatal(VsoaErrorKind::ProtocolError))?;
    body.trim().parse().map_err(|_| VsoaError::Fatal(VsoaErrorKind::AddrParse))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_literal_socket_addr_without_a_position_server() {
        let addr = resolve("127.0.0.1:9000").unwrap();
        assert_eq!(addr.port(), 9000);
    }

    #[test]
    fn unresolvable_name_without_position_server_errors() {
        env::remove_var(ENV_POSITION_SERVER);
        assert_eq!(resolve("my-service"), Err(VsoaError::Fatal(VsoaErrorKind::NotFound)));
    }

    #[test]
    fn position_server_query_times_out() {
        // Bind a socket that never replies; the position server's response window should expire
        // as a fatal, distinguishable `Timeout`, not the retryable `Wait`.
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = silent.local_addr().unwrap();
        env::set_var(ENV_POSITION_SERVER, addr.to_string());

        let result = resolve("my-service");
        env::remove_var(ENV_POSITION_SERVER);
        assert_eq!(result, Err(VsoaError::Fatal(VsoaErrorKind::Timeout)));
    }
}

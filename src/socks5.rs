//! SOCKS5 client negotiation.
//!
//! Runs over a stream that is already connected to the proxy and in blocking
//! mode. Only the no-authentication method and the CONNECT command are
//! spoken; there is no retry and no fallback, a failed negotiation is a
//! failed connection.

use std::io::{Read, Write};

use crate::endpoint::Endpoint;
use crate::error::{HookError, ReplyCode, Result, Socks5ErrorKind};

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_AUTH_NONE: u8 = 0x00;

const SOCKS5_CMD_CONNECT: u8 = 0x01;

const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;

/// Longest domain name the length-prefixed address field can carry.
pub const MAX_DOMAIN_LEN: usize = 255;

/// Send the greeting offering no-auth and check the server picked it.
pub fn handshake<S: Read + Write>(stream: &mut S) -> Result<()> {
    stream
        .write_all(&[SOCKS5_VERSION, 1, SOCKS5_AUTH_NONE])
        .map_err(|e| HookError::socks5(Socks5ErrorKind::Io, format!("Failed to send greeting: {}", e)))?;

    let mut resp = [0u8; 2];
    stream.read_exact(&mut resp).map_err(|e| {
        HookError::socks5(
            Socks5ErrorKind::Io,
            format!("Failed to read method selection: {}", e),
        )
    })?;

    if resp[0] != SOCKS5_VERSION {
        return Err(HookError::socks5(
            Socks5ErrorKind::Handshake,
            format!("Invalid SOCKS version: {}", resp[0]),
        ));
    }
    if resp[1] != SOCKS5_AUTH_NONE {
        return Err(HookError::socks5(
            Socks5ErrorKind::Handshake,
            format!("Unsupported authentication method: {:#04x}", resp[1]),
        ));
    }
    Ok(())
}

/// Encode a CONNECT request for `target`.
///
/// Fails for domains longer than [`MAX_DOMAIN_LEN`] bytes.
pub fn encode_request(target: &Endpoint) -> Result<Vec<u8>> {
    let mut req = vec![SOCKS5_VERSION, SOCKS5_CMD_CONNECT, 0x00];
    match target {
        Endpoint::V4(v4) => {
            req.push(SOCKS5_ATYP_IPV4);
            req.extend_from_slice(&v4.ip().octets());
        }
        Endpoint::V6(v6) => {
            req.push(SOCKS5_ATYP_IPV6);
            req.extend_from_slice(&v6.ip().octets());
        }
        Endpoint::Domain { host, .. } => {
            let domain = host.as_bytes();
            if domain.len() > MAX_DOMAIN_LEN {
                return Err(HookError::socks5(
                    Socks5ErrorKind::Encoding,
                    format!("Domain name of {} bytes is too long", domain.len()),
                ));
            }
            req.push(SOCKS5_ATYP_DOMAIN);
            req.push(domain.len() as u8);
            req.extend_from_slice(domain);
        }
    }
    req.extend_from_slice(&target.port().to_be_bytes());
    Ok(req)
}

/// Send a CONNECT request and read the reply.
///
/// A non-zero reply status is returned as [`HookError::Rejected`] without
/// reading the bound address that follows it. On success the bound address
/// is drained so the stream is positioned at the first relayed byte.
pub fn request<S: Read + Write>(stream: &mut S, target: &Endpoint) -> Result<()> {
    let req = encode_request(target)?;
    stream
        .write_all(&req)
        .map_err(|e| HookError::socks5(Socks5ErrorKind::Io, format!("Failed to send request: {}", e)))?;

    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .map_err(|e| HookError::socks5(Socks5ErrorKind::Io, format!("Failed to read reply: {}", e)))?;

    let status = ReplyCode(header[1]);
    if !status.is_success() {
        return Err(HookError::Rejected(status));
    }
    if header[0] != SOCKS5_VERSION {
        return Err(HookError::socks5(
            Socks5ErrorKind::Protocol,
            format!("Invalid SOCKS version in reply: {}", header[0]),
        ));
    }

    // Bound address and port.
    let remaining = match header[3] {
        SOCKS5_ATYP_IPV4 => 4 + 2,
        SOCKS5_ATYP_IPV6 => 16 + 2,
        SOCKS5_ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).map_err(|e| {
                HookError::socks5(
                    Socks5ErrorKind::Io,
                    format!("Failed to read bound domain length: {}", e),
                )
            })?;
            len[0] as usize + 2
        }
        atyp => {
            return Err(HookError::socks5(
                Socks5ErrorKind::Protocol,
                format!("Unknown address type: {}", atyp),
            ));
        }
    };

    let mut bound = [0u8; MAX_DOMAIN_LEN + 2];
    stream.read_exact(&mut bound[..remaining]).map_err(|e| {
        HookError::socks5(
            Socks5ErrorKind::Io,
            format!("Failed to read bound address: {}", e),
        )
    })?;
    Ok(())
}

/// Handshake followed by CONNECT.
pub fn negotiate<S: Read + Write>(stream: &mut S, target: &Endpoint) -> Result<()> {
    handshake(stream)?;
    request(stream, target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};

    /// Scripted proxy side: replies come from `input`, requests land in `output`.
    struct ScriptedStream {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl ScriptedStream {
        fn new(replies: &[u8]) -> Self {
            Self {
                input: Cursor::new(replies.to_vec()),
                output: Vec::new(),
            }
        }

        fn unread(&self) -> usize {
            self.input.get_ref().len() - self.input.position() as usize
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_handshake_success() {
        let mut stream = ScriptedStream::new(&[5, 0]);
        handshake(&mut stream).unwrap();
        assert_eq!(stream.output, vec![5, 1, 0]);
    }

    #[test]
    fn test_handshake_rejects_auth_method() {
        let mut stream = ScriptedStream::new(&[5, 0xFF]);
        let err = handshake(&mut stream).unwrap_err();
        assert!(matches!(
            err,
            HookError::Socks5 {
                kind: Socks5ErrorKind::Handshake,
                ..
            }
        ));
    }

    #[test]
    fn test_handshake_short_read() {
        let mut stream = ScriptedStream::new(&[5]);
        let err = handshake(&mut stream).unwrap_err();
        assert!(matches!(
            err,
            HookError::Socks5 {
                kind: Socks5ErrorKind::Io,
                ..
            }
        ));
    }

    #[test]
    fn test_handshake_wrong_version() {
        let mut stream = ScriptedStream::new(&[4, 0]);
        assert!(handshake(&mut stream).is_err());
    }

    #[test]
    fn test_encode_request_ipv4() {
        let target: Endpoint = "93.184.216.34:80".parse().unwrap();
        let req = encode_request(&target).unwrap();
        assert_eq!(req, vec![5, 1, 0, 1, 93, 184, 216, 34, 0, 80]);
    }

    #[test]
    fn test_encode_request_ipv6() {
        let target: Endpoint = "[2001:db8::1]:443".parse().unwrap();
        let req = encode_request(&target).unwrap();
        assert_eq!(req.len(), 4 + 16 + 2);
        assert_eq!(req[3], SOCKS5_ATYP_IPV6);
        assert_eq!(&req[4..6], &[0x20, 0x01]);
        assert_eq!(&req[20..], &443u16.to_be_bytes());
    }

    #[test]
    fn test_encode_request_domain() {
        let req = encode_request(&Endpoint::domain("example.com", 443)).unwrap();
        assert_eq!(req[3], SOCKS5_ATYP_DOMAIN);
        assert_eq!(req[4], 11);
        assert_eq!(&req[5..16], b"example.com");
        assert_eq!(&req[16..], &[0x01, 0xBB]);
    }

    #[test]
    fn test_domain_of_255_bytes_frames() {
        let host = "a".repeat(255);
        let mut stream = ScriptedStream::new(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
        request(&mut stream, &Endpoint::domain(host, 80)).unwrap();
        assert_eq!(stream.output.len(), 4 + 1 + 255 + 2);
        assert_eq!(stream.output[4], 255);
    }

    #[test]
    fn test_domain_of_256_bytes_fails_before_sending() {
        let host = "a".repeat(256);
        let mut stream = ScriptedStream::new(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
        let err = request(&mut stream, &Endpoint::domain(host, 80)).unwrap_err();
        assert!(matches!(
            err,
            HookError::Socks5 {
                kind: Socks5ErrorKind::Encoding,
                ..
            }
        ));
        assert!(stream.output.is_empty());
        assert_eq!(err.socks_status(), Some(ReplyCode::GENERAL_FAILURE));
    }

    #[test]
    fn test_request_rejection_skips_bound_address() {
        // Status 4 followed by a full IPv4 bound address that must stay unread.
        let mut stream = ScriptedStream::new(&[5, 4, 0, 1, 10, 0, 0, 1, 0x04, 0x38]);
        let target: Endpoint = "93.184.216.34:80".parse().unwrap();
        let err = request(&mut stream, &target).unwrap_err();
        assert!(matches!(err, HookError::Rejected(ReplyCode::HOST_UNREACHABLE)));
        assert_eq!(stream.unread(), 6);
    }

    #[test]
    fn test_request_drains_ipv4_bound_address() {
        let mut stream = ScriptedStream::new(&[5, 0, 0, 1, 10, 0, 0, 1, 0x04, 0x38, 0xAA]);
        let target: Endpoint = "93.184.216.34:80".parse().unwrap();
        request(&mut stream, &target).unwrap();
        assert_eq!(stream.unread(), 1);
    }

    #[test]
    fn test_request_drains_ipv6_bound_address() {
        let mut reply = vec![5, 0, 0, 4];
        reply.extend_from_slice(&[0u8; 18]);
        reply.push(0xAA);
        let mut stream = ScriptedStream::new(&reply);
        request(&mut stream, &Endpoint::domain("example.com", 80)).unwrap();
        assert_eq!(stream.unread(), 1);
    }

    #[test]
    fn test_request_drains_domain_bound_address() {
        let mut reply = vec![5, 0, 0, 3, 5];
        reply.extend_from_slice(b"proxy");
        reply.extend_from_slice(&[0, 80, 0xAA]);
        let mut stream = ScriptedStream::new(&reply);
        request(&mut stream, &Endpoint::domain("example.com", 80)).unwrap();
        assert_eq!(stream.unread(), 1);
    }

    #[test]
    fn test_request_unknown_address_type() {
        let mut stream = ScriptedStream::new(&[5, 0, 0, 9]);
        let target: Endpoint = "1.2.3.4:80".parse().unwrap();
        let err = request(&mut stream, &target).unwrap_err();
        assert!(matches!(
            err,
            HookError::Socks5 {
                kind: Socks5ErrorKind::Protocol,
                ..
            }
        ));
    }

    #[test]
    fn test_request_truncated_reply_is_general_failure() {
        let mut stream = ScriptedStream::new(&[5, 0]);
        let target: Endpoint = "1.2.3.4:80".parse().unwrap();
        let err = request(&mut stream, &target).unwrap_err();
        assert_eq!(err.socks_status(), Some(ReplyCode::GENERAL_FAILURE));
    }

    #[test]
    fn test_negotiate_full_exchange() {
        let mut stream = ScriptedStream::new(&[5, 0, 5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
        let target: Endpoint = "93.184.216.34:80".parse().unwrap();
        negotiate(&mut stream, &target).unwrap();
        assert_eq!(
            stream.output,
            vec![5, 1, 0, 5, 1, 0, 1, 93, 184, 216, 34, 0, 80]
        );
        assert_eq!(stream.unread(), 0);
    }
}

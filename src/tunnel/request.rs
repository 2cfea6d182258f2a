//! Registration exchange
//!
//! One headers-only HTTP/1.1 request goes out, one status line and header
//! block comes back. After the blank line the socket is a raw byte pipe,
//! so the response is read byte by byte: nothing past the header block
//! may be consumed.

use super::{Destination, TunnelError};
use crate::disguise::{DisguiseProfile, RequestContext};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Maximum number of header lines accepted in the response
pub const MAX_HEADER_LINES: usize = 50;

/// Maximum length of a single response line
pub const MAX_LINE_LEN: usize = 8192;

/// The disguised registration request
#[derive(Debug, Clone)]
pub struct RegistrationRequest<'a> {
    destination: &'a Destination,
    disguise: &'a DisguiseProfile,
    auth_token: &'a str,
    tunnel_type: &'a str,
}

impl<'a> RegistrationRequest<'a> {
    /// Create a request for one attempt
    pub fn new(
        destination: &'a Destination,
        disguise: &'a DisguiseProfile,
        auth_token: &'a str,
        tunnel_type: &'a str,
    ) -> Self {
        Self {
            destination,
            disguise,
            auth_token,
            tunnel_type,
        }
    }

    /// Request target: path plus tunnel type and disguise id
    pub fn target(&self) -> String {
        let separator = if self.disguise.request_path.contains('?') {
            '&'
        } else {
            '?'
        };
        format!(
            "{}{}type={}&protocol={}",
            self.disguise.request_path, separator, self.tunnel_type, self.disguise.id
        )
    }

    /// Reject field values that would break the request framing
    pub fn validate(&self) -> Result<(), TunnelError> {
        check_auth_token(self.auth_token)?;
        check_tunnel_type(self.tunnel_type)
    }

    /// Encode with a fresh template context
    pub fn encode(&self) -> String {
        self.encode_with(&RequestContext::new(self.destination.host.clone()))
    }

    /// Encode with an explicit template context
    pub fn encode_with(&self, ctx: &RequestContext) -> String {
        let mut request = String::with_capacity(512);

        request.push_str(&format!("POST {} HTTP/1.1\r\n", self.target()));
        request.push_str(&format!("Host: {}\r\n", self.destination.authority()));
        request.push_str(&format!("Authorization: Bearer {}\r\n", self.auth_token));
        request.push_str(&format!("X-Tunnel-Type: {}\r\n", self.tunnel_type));
        request.push_str(&format!("X-Protocol: {}\r\n", self.disguise.id));
        for (name, value) in self.disguise.render_headers(ctx) {
            request.push_str(&format!("{}: {}\r\n", name, value));
        }
        request.push_str("Connection: keep-alive\r\n\r\n");

        request
    }
}

/// Bearer tokens must be non-empty visible ASCII
pub fn check_auth_token(token: &str) -> Result<(), TunnelError> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(TunnelError::InvalidRequest(
            "auth token must be non-empty visible ASCII".to_string(),
        ));
    }
    Ok(())
}

/// Tunnel types go into the query string and a header unescaped
pub fn check_tunnel_type(tunnel_type: &str) -> Result<(), TunnelError> {
    let valid = !tunnel_type.is_empty()
        && tunnel_type
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
    if !valid {
        return Err(TunnelError::InvalidRequest(format!(
            "tunnel type {:?} may only contain letters, digits, '-', '_' and '.'",
            tunnel_type
        )));
    }
    Ok(())
}

/// Parsed status line and headers of the registration response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// Status code
    pub status: u16,
    /// Reason phrase
    pub reason: String,
    /// Header lines in arrival order, names as sent
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Send the request and validate the response
///
/// The whole response head must arrive within `read_timeout`. Any status
/// other than 200 is a rejection.
pub async fn register<S>(
    stream: &mut S,
    request: &str,
    read_timeout: Duration,
) -> Result<ResponseHead, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let head = tokio::time::timeout(read_timeout, read_response_head(stream))
        .await
        .map_err(|_| TunnelError::Timeout)??;

    debug!("Registration response: {} {}", head.status, head.reason);

    if head.status != 200 {
        return Err(TunnelError::Rejected(head.status));
    }
    Ok(head)
}

/// Read a status line and header block terminated by a blank line
pub async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead, TunnelError>
where
    R: AsyncRead + Unpin,
{
    let status_line = read_line(reader).await?;
    let (status, reason) = parse_status_line(&status_line)?;

    let mut headers = Vec::new();
    loop {
        let line = read_line(reader).await?;
        if line.is_empty() {
            break;
        }
        if headers.len() >= MAX_HEADER_LINES {
            return Err(TunnelError::MalformedResponse(format!(
                "more than {} header lines",
                MAX_HEADER_LINES
            )));
        }

        trace!("Response header: {}", line);
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| TunnelError::MalformedResponse(format!("bad header line: {}", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(ResponseHead {
        status,
        reason,
        headers,
    })
}

fn parse_status_line(line: &str) -> Result<(u16, String), TunnelError> {
    let malformed = || TunnelError::MalformedResponse(format!("bad status line: {:?}", line));

    let mut parts = line.splitn(3, ' ');
    let version = parts.next().ok_or_else(malformed)?;
    if !version.starts_with("HTTP/") {
        return Err(malformed());
    }

    let code = parts.next().ok_or_else(malformed)?;
    if code.len() != 3 {
        return Err(malformed());
    }
    let status = code.parse::<u16>().map_err(|_| malformed())?;
    let reason = parts.next().unwrap_or("").trim().to_string();

    Ok((status, reason))
}

/// Read one CRLF (or bare LF) terminated line, without the terminator
async fn read_line<R>(reader: &mut R) -> Result<String, TunnelError>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];

    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return Err(TunnelError::MalformedResponse(
                "connection closed inside response head".to_string(),
            ));
        }
        if byte[0] == b'\n' {
            break;
        }
        if line.len() >= MAX_LINE_LEN {
            return Err(TunnelError::MalformedResponse(format!(
                "response line longer than {} bytes",
                MAX_LINE_LEN
            )));
        }
        line.push(byte[0]);
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }

    String::from_utf8(line)
        .map_err(|_| TunnelError::MalformedResponse("response head is not UTF-8".to_string()))
}

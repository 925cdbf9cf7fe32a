//! Transport establishment, capability/auth handshake, and the
//! tagged-command primitives every other component is built on.

use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use async_native_tls::TlsStream;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use md5::Md5;
use mailsweep_proto::{Chunk, Node, reassemble};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tracing::trace;

use crate::account::{Account, Transport};
use crate::error::ConnectionError;

/// The underlying byte stream, plain or TLS-wrapped. `STARTTLS` replaces
/// a `Plain` connection with a `Tls` one in place of a duck-typed
/// subclass swap.
pub enum Wire {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl AsyncRead for Wire {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Wire::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Wire::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Wire {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Wire::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Wire::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Wire::Plain(s) => Pin::new(s).poll_flush(cx),
            Wire::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Wire::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Wire::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// One tagged command's outcome: status word (`OK`/`NO`/`BAD`), the
/// remainder of the tagged line, and the untagged response lines
/// collected along the way, each already reassembled across any
/// embedded literals.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: String,
    pub text: String,
    pub lines: Vec<(Vec<u8>, Vec<Vec<u8>>)>,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.status.eq_ignore_ascii_case("OK")
    }

    pub fn parsed_lines(&self) -> Result<Vec<Vec<Node>>, ConnectionError> {
        self.lines
            .iter()
            .map(|(line, literals)| mailsweep_proto::parse(line, literals).map_err(Into::into))
            .collect()
    }
}

pub struct Connection {
    io: BufReader<Wire>,
    tag_gen: mailsweep_proto::command::TagGenerator,
    capabilities: Vec<String>,
    debug: bool,
}

impl Connection {
    /// Opens the transport, runs STARTTLS if requested, verifies
    /// `IMAP4rev1`, and authenticates. Matches §4.2 exactly.
    pub async fn establish(account: &Account, debug: bool) -> Result<Connection, ConnectionError> {
        let tcp = tokio::time::timeout(
            account.socket_timeout,
            TcpStream::connect((account.host.as_str(), account.port)),
        )
        .await
        .map_err(|_| ConnectionError::Timeout)??;

        let wire = match account.transport {
            Transport::Plain | Transport::StartTls => Wire::Plain(tcp),
            Transport::Ssl => {
                let connector = async_native_tls::TlsConnector::new();
                let tls = tokio::time::timeout(
                    account.socket_timeout,
                    connector.connect(&account.host, tcp),
                )
                .await
                .map_err(|_| ConnectionError::Timeout)??;
                Wire::Tls(tls)
            }
        };

        let mut conn = Connection {
            io: BufReader::new(wire),
            tag_gen: mailsweep_proto::command::TagGenerator::new(),
            capabilities: Vec::new(),
            debug,
        };

        let greeting = conn.read_raw_line().await?;
        conn.trace_recv(&greeting);

        let mut conn = if account.transport == Transport::StartTls {
            conn.upgrade_to_tls(account).await?
        } else {
            conn
        };

        conn.capability().await?;
        conn.authenticate(account).await?;
        Ok(conn)
    }

    async fn upgrade_to_tls(mut self, account: &Account) -> Result<Connection, ConnectionError> {
        let resp = self.command("STARTTLS", "").await?;
        if !resp.is_ok() {
            return Err(ConnectionError::CommandFailure { tag: "starttls".to_string(), text: resp.text });
        }

        let wire = self.io.into_inner();
        let tcp = match wire {
            Wire::Plain(tcp) => tcp,
            Wire::Tls(_) => {
                return Err(ConnectionError::CommandFailure {
                    tag: "starttls".to_string(),
                    text: "connection is already using TLS".to_string(),
                });
            }
        };

        let connector = async_native_tls::TlsConnector::new();
        let tls = tokio::time::timeout(account.socket_timeout, connector.connect(&account.host, tcp))
            .await
            .map_err(|_| ConnectionError::Timeout)??;

        Ok(Connection {
            io: BufReader::new(Wire::Tls(tls)),
            tag_gen: self.tag_gen,
            capabilities: Vec::new(),
            debug: self.debug,
        })
    }

    async fn capability(&mut self) -> Result<(), ConnectionError> {
        let resp = self.command("CAPABILITY", "").await?;
        if !resp.is_ok() {
            return Err(ConnectionError::CommandFailure { tag: "capability".to_string(), text: resp.text });
        }

        let mut caps = Vec::new();
        for nodes in resp.parsed_lines()? {
            for node in nodes.iter().skip(2) {
                if let Some(atom) = node.as_atom() {
                    caps.push(String::from_utf8_lossy(atom).to_string());
                }
            }
        }

        if !caps.iter().any(|c| c.as_str() == "IMAP4rev1") {
            return Err(ConnectionError::MissingCapability);
        }

        self.capabilities = caps;
        Ok(())
    }

    async fn authenticate(&mut self, account: &Account) -> Result<(), ConnectionError> {
        let password = account
            .password()
            .await
            .map_err(|err| ConnectionError::AuthFailure { tag: "auth".to_string(), text: err.to_string() })?
            .to_string();

        if self.capabilities.iter().any(|c| c.eq_ignore_ascii_case("AUTH=CRAM-MD5")) {
            return self.auth_cram_md5(&account.user, &password).await;
        }

        let plaintext_ok = account.transport != Transport::Plain || account.auth_policy.plaintext_allowed;
        if account.auth_policy.login_allowed && plaintext_ok {
            return self.auth_login(&account.user, &password).await;
        }

        Err(ConnectionError::AuthPolicyFailure)
    }

    async fn auth_cram_md5(&mut self, user: &str, password: &str) -> Result<(), ConnectionError> {
        let tag = self.tag_gen.next_tag();
        self.send_line(&mailsweep_proto::command::tagged(&tag, "AUTHENTICATE", "CRAM-MD5")).await?;

        let cont = self.read_raw_line().await?;
        self.trace_recv(&cont);
        let challenge_b64 = cont.strip_prefix(b"+ ").unwrap_or(&cont);
        let challenge = BASE64.decode(challenge_b64).map_err(|err| ConnectionError::AuthFailure {
            tag: tag.clone(),
            text: format!("invalid base64 challenge: {err}"),
        })?;

        let mut mac = Hmac::<Md5>::new_from_slice(password.as_bytes())
            .expect("HMAC accepts a key of any length");
        mac.update(&challenge);
        let digest = hex_lower(&mac.finalize().into_bytes());

        let response_plain = format!("{user} {digest}");
        let response_line = format!("{}\r\n", BASE64.encode(response_plain));
        self.send_line(&response_line).await?;

        let resp = self.read_response(&tag).await?;
        if resp.is_ok() { Ok(()) } else { Err(ConnectionError::AuthFailure { tag, text: resp.text }) }
    }

    async fn auth_login(&mut self, user: &str, password: &str) -> Result<(), ConnectionError> {
        let args = format!(
            "{} {}",
            mailsweep_proto::command::quote(user),
            mailsweep_proto::command::quote(password)
        );
        let resp = self.command("LOGIN", &args).await?;
        if resp.is_ok() {
            Ok(())
        } else {
            Err(ConnectionError::AuthFailure { tag: "login".to_string(), text: resp.text })
        }
    }

    /// Sends one tagged command and collects its full response.
    pub async fn command(&mut self, verb: &str, args: &str) -> Result<Response, ConnectionError> {
        let tag = self.tag_gen.next_tag();
        self.send_line(&mailsweep_proto::command::tagged(&tag, verb, args)).await?;
        self.read_response(&tag).await
    }

    async fn send_line(&mut self, line: &str) -> Result<(), ConnectionError> {
        self.trace_send(line.as_bytes());
        self.io.write_all(line.as_bytes()).await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn read_response(&mut self, tag: &str) -> Result<Response, ConnectionError> {
        let prefix = format!("{tag} ");
        let mut chunks = Vec::new();

        loop {
            let raw = self.read_raw_line().await?;
            self.trace_recv(&raw);

            if let Some(rest) = raw.strip_prefix(prefix.as_bytes()) {
                let text = String::from_utf8_lossy(rest).to_string();
                let status = text.split_whitespace().next().unwrap_or("").to_string();
                return Ok(Response { status, text, lines: reassemble(chunks) });
            }

            if let Some(len) = trailing_literal_len(&raw) {
                let literal = self.read_exact_bytes(len).await?;
                self.trace_recv(&literal);
                chunks.push(Chunk::Text(raw));
                chunks.push(Chunk::Literal(literal));
            } else {
                chunks.push(Chunk::Text(raw));
            }
        }
    }

    async fn read_raw_line(&mut self) -> Result<Vec<u8>, ConnectionError> {
        let mut buf = Vec::new();
        let n = self.io.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Err(ConnectionError::UnexpectedEof);
        }
        while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
            buf.pop();
        }
        Ok(buf)
    }

    async fn read_exact_bytes(&mut self, n: usize) -> Result<Vec<u8>, ConnectionError> {
        let mut buf = vec![0u8; n];
        self.io.read_exact(&mut buf).await?;
        Ok(buf)
    }

    fn trace_send(&self, bytes: &[u8]) {
        self.trace("C:", bytes);
    }

    fn trace_recv(&self, bytes: &[u8]) {
        self.trace("S:", bytes);
    }

    fn trace(&self, prefix: &str, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        if self.debug {
            eprintln!("{prefix} {}", text.trim_end());
        }
        trace!(target: "mailsweep::wire", "{prefix} {}", text.trim_end());
    }

    /// LOGOUTs and consumes the connection; used when every prior step
    /// of a session succeeded.
    pub async fn logout(mut self) {
        if let Ok(resp) = self.command("LOGOUT", "").await {
            let _ = resp;
        }
    }

    /// Drops the connection without a LOGOUT handshake, forcing the
    /// socket closed; used when a step before authentication failed.
    pub fn force_close(self) {
        drop(self);
    }
}

/// Parses a trailing `{N}` or `{N+}` literal-length marker, if present,
/// from a raw (CRLF-stripped) response line.
fn trailing_literal_len(line: &[u8]) -> Option<usize> {
    if line.last() != Some(&b'}') {
        return None;
    }
    let open = line.iter().rposition(|&b| b == b'{')?;
    let inner = std::str::from_utf8(&line[open + 1..line.len() - 1]).ok()?;
    inner.trim_end_matches('+').parse().ok()
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").expect("writing to a String never fails");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_literal_len_parses_plain_and_nonsync_markers() {
        assert_eq!(trailing_literal_len(b"UID FETCH 1 BODY[] {128}"), Some(128));
        assert_eq!(trailing_literal_len(b"UID FETCH 1 BODY[] {128+}"), Some(128));
        assert_eq!(trailing_literal_len(b"A1 OK done"), None);
        assert_eq!(trailing_literal_len(b"{not a number}"), None);
    }

    #[test]
    fn hex_lower_matches_known_digest() {
        assert_eq!(hex_lower(&[0x00, 0xff, 0x10]), "00ff10");
    }
}

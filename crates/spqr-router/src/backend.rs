//! Backend connections to data shards
//!
//! One authenticated session to one shard host: TCP connect, optional
//! TLS upgrade via SSLRequest, startup, then the authentication pump
//! until the shard reports ReadyForQuery. Reconnection is the caller's
//! concern; nothing here retries.

use crate::pg_wire::auth::md5_password;
use crate::pg_wire::protocol::{
    read_frame, write_frontend, write_raw, BackendMessage, FrontendMessage,
};
use spqr_common::{BackendRule, Result, SpqrError, SslMode};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Stream trait object so plain and TLS connections share one type
pub trait BackendStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> BackendStream for T {}

/// An authenticated connection to one shard host, lent to at most one
/// client at a time.
pub struct BackendConn {
    shard_id: String,
    host: String,
    stream: Box<dyn BackendStream>,
}

impl std::fmt::Debug for BackendConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConn")
            .field("shard_id", &self.shard_id)
            .field("host", &self.host)
            .finish()
    }
}

impl BackendConn {
    /// Dial and authenticate against `host` under a deadline.
    pub async fn dial(
        shard_id: &str,
        host: &str,
        rule: &BackendRule,
        deadline: Duration,
    ) -> Result<Self> {
        tokio::time::timeout(deadline, Self::dial_inner(shard_id, host, rule))
            .await
            .map_err(|_| SpqrError::Timeout(format!("dial {} ({})", shard_id, host)))?
    }

    async fn dial_inner(shard_id: &str, host: &str, rule: &BackendRule) -> Result<Self> {
        let tcp = TcpStream::connect(host)
            .await
            .map_err(|e| SpqrError::ShardUnavailable(format!("{}: {}", shard_id, e)))?;

        let mut stream: Box<dyn BackendStream> = match rule.ssl_mode {
            SslMode::Disable => Box::new(tcp),
            mode => negotiate_tls(tcp, host, mode).await?,
        };

        handshake(&mut stream, rule).await?;
        debug!(shard = %shard_id, host = %host, "backend connection ready");

        Ok(Self {
            shard_id: shard_id.to_string(),
            host: host.to_string(),
            stream,
        })
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Send one typed message.
    pub async fn send(&mut self, msg: &FrontendMessage) -> Result<()> {
        write_frontend(&mut self.stream, msg).await
    }

    /// Forward a raw frame without re-encoding.
    pub async fn send_raw(&mut self, tag: u8, body: &[u8]) -> Result<()> {
        write_raw(&mut self.stream, tag, body).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive one typed message; EOF surfaces as ShardUnavailable.
    pub async fn receive(&mut self) -> Result<BackendMessage> {
        let (tag, body) = self.receive_raw().await?;
        BackendMessage::decode(tag, &body)
    }

    /// Receive one raw frame for verbatim forwarding.
    pub async fn receive_raw(&mut self) -> Result<(u8, Vec<u8>)> {
        read_frame(&mut self.stream)
            .await?
            .ok_or_else(|| SpqrError::ShardUnavailable(format!("{} closed connection", self.shard_id)))
    }

    pub async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// Send SSLRequest and upgrade when the shard accepts. A shard that
/// answers `N` under `require` policy fails the dial.
async fn negotiate_tls(
    mut tcp: TcpStream,
    host: &str,
    mode: SslMode,
) -> Result<Box<dyn BackendStream>> {
    write_frontend(&mut tcp, &FrontendMessage::SslRequest).await?;

    let mut answer = [0u8; 1];
    tcp.read_exact(&mut answer).await?;

    match answer[0] {
        b'S' => {
            let config = Arc::new(spqr_common::create_client_tls_config());
            let connector = TlsConnector::from(config);
            let server_name = host
                .split(':')
                .next()
                .unwrap_or(host)
                .to_string()
                .try_into()
                .map_err(|_| SpqrError::Internal(format!("bad host name {}", host)))?;
            let tls = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| SpqrError::ShardUnavailable(format!("TLS handshake: {}", e)))?;
            Ok(Box::new(tls))
        }
        b'N' if mode == SslMode::Require => Err(SpqrError::SslRequired),
        b'N' => Ok(Box::new(tcp)),
        other => Err(SpqrError::Protocol(format!(
            "unexpected SSL negotiation answer {:?}",
            other as char
        ))),
    }
}

/// Startup + authentication against a shard. ParameterStatus and
/// BackendKeyData are discarded; ReadyForQuery completes the exchange.
pub(crate) async fn handshake<S>(stream: &mut S, rule: &BackendRule) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let startup = FrontendMessage::Startup {
        protocol_version: crate::pg_wire::protocol::PROTOCOL_VERSION,
        parameters: vec![
            ("user".into(), rule.user.clone()),
            ("database".into(), rule.database.clone()),
            ("application_name".into(), "spqr".into()),
            ("client_encoding".into(), "UTF8".into()),
        ],
    };
    write_frontend(stream, &startup).await?;

    loop {
        let (tag, body) = read_frame(stream)
            .await?
            .ok_or_else(|| SpqrError::AuthFailed("shard closed connection during auth".into()))?;

        match BackendMessage::decode(tag, &body)? {
            BackendMessage::ReadyForQuery { .. } => return Ok(()),
            BackendMessage::AuthenticationOk => {}
            BackendMessage::AuthenticationCleartextPassword => {
                let password = rule.password.clone().unwrap_or_default();
                write_frontend(stream, &FrontendMessage::Password(password)).await?;
            }
            BackendMessage::AuthenticationMd5Password { salt } => {
                let password = rule.password.clone().unwrap_or_default();
                let digest = md5_password(&rule.user, &password, &salt);
                write_frontend(stream, &FrontendMessage::Password(digest)).await?;
            }
            BackendMessage::ErrorResponse { message, .. } => {
                return Err(SpqrError::AuthFailed(message));
            }
            BackendMessage::ParameterStatus { name, value } => {
                debug!(name = %name, value = %value, "ignored parameter status");
            }
            BackendMessage::BackendKeyData { process_id, .. } => {
                debug!(pid = process_id, "ignored backend key data");
            }
            other => {
                debug!("unexpected message during backend auth: {:?}", other);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg_wire::protocol::write_backend;

    fn rule() -> BackendRule {
        BackendRule {
            user: "spqr".into(),
            database: "db1".into(),
            password: Some("secret".into()),
            ssl_mode: SslMode::Disable,
        }
    }

    #[tokio::test]
    async fn test_handshake_md5() {
        let (mut proxy, mut shard) = tokio::io::duplex(4096);

        let server = tokio::spawn(async move {
            // Expect the startup message with spqr identity parameters
            let body = crate::pg_wire::protocol::read_startup_frame(&mut shard)
                .await
                .unwrap();
            let startup = FrontendMessage::decode_startup(&body).unwrap();
            match startup {
                FrontendMessage::Startup { parameters, .. } => {
                    assert!(parameters.contains(&("application_name".into(), "spqr".into())));
                    assert!(parameters.contains(&("user".into(), "spqr".into())));
                }
                other => panic!("expected startup, got {:?}", other),
            }

            let salt = [0x01, 0x02, 0x03, 0x04];
            write_backend(&mut shard, &BackendMessage::AuthenticationMd5Password { salt })
                .await
                .unwrap();

            let (tag, body) = read_frame(&mut shard).await.unwrap().unwrap();
            let password = match FrontendMessage::decode(tag, &body).unwrap() {
                FrontendMessage::Password(p) => p,
                other => panic!("expected password, got {:?}", other),
            };
            assert_eq!(password, md5_password("spqr", "secret", &salt));

            write_backend(&mut shard, &BackendMessage::AuthenticationOk)
                .await
                .unwrap();
            write_backend(
                &mut shard,
                &BackendMessage::ParameterStatus {
                    name: "server_version".into(),
                    value: "14.5".into(),
                },
            )
            .await
            .unwrap();
            write_backend(
                &mut shard,
                &BackendMessage::BackendKeyData {
                    process_id: 7,
                    secret_key: 9,
                },
            )
            .await
            .unwrap();
            write_backend(&mut shard, &BackendMessage::ReadyForQuery { status: b'I' })
                .await
                .unwrap();
        });

        handshake(&mut proxy, &rule()).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_error_response_fails_auth() {
        let (mut proxy, mut shard) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            let _ = crate::pg_wire::protocol::read_startup_frame(&mut shard).await;
            write_backend(
                &mut shard,
                &BackendMessage::ErrorResponse {
                    severity: "FATAL".into(),
                    code: "28P01".into(),
                    message: "password authentication failed".into(),
                },
            )
            .await
            .unwrap();
        });

        let err = handshake(&mut proxy, &rule()).await.unwrap_err();
        assert!(matches!(err, SpqrError::AuthFailed(_)));
    }
}

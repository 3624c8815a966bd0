//! Frontend authentication
//!
//! Challenges the client according to its frontend rule: trust accepts
//! outright, cleartext and md5 verify against the rule's stored
//! password. Failures answer with SQLSTATE 28P01 before closing.

use super::protocol::{read_frame, write_backend, BackendMessage, FrontendMessage};
use spqr_common::{AuthMethod, FrontendRule, Result, SpqrError};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Compute the PostgreSQL md5 password response:
/// `"md5" + hex(md5(hex(md5(password + user)) + salt))`.
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = format!("{:x}", md5::compute(format!("{}{}", password, user)));
    let mut outer = inner.into_bytes();
    outer.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(outer))
}

/// Run the challenge selected by `rule`. On success the client has NOT
/// yet seen AuthenticationOk; the caller sends the greeting sequence.
pub async fn authenticate_frontend<S>(
    stream: &mut S,
    rule: &FrontendRule,
    user: &str,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match rule.auth_method {
        AuthMethod::Trust => {
            debug!(user = %user, "trust auth, accepting");
            Ok(())
        }
        AuthMethod::Cleartext => {
            write_backend(stream, &BackendMessage::AuthenticationCleartextPassword).await?;
            let offered = read_password(stream).await?;
            let expected = rule.password.clone().unwrap_or_default();
            if offered == expected {
                info!(user = %user, "cleartext auth OK");
                Ok(())
            } else {
                reject(stream, user).await
            }
        }
        AuthMethod::Md5 => {
            let salt: [u8; 4] = rand::random();
            write_backend(stream, &BackendMessage::AuthenticationMd5Password { salt }).await?;
            let offered = read_password(stream).await?;
            let expected = md5_password(user, &rule.password.clone().unwrap_or_default(), &salt);
            if offered == expected {
                info!(user = %user, "md5 auth OK");
                Ok(())
            } else {
                reject(stream, user).await
            }
        }
    }
}

async fn read_password<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (tag, body) = read_frame(stream)
        .await?
        .ok_or_else(|| SpqrError::AuthFailed("client closed connection".into()))?;

    match FrontendMessage::decode(tag, &body)? {
        FrontendMessage::Password(password) => Ok(password),
        other => Err(SpqrError::Protocol(format!(
            "expected password message, got {:?}",
            other
        ))),
    }
}

async fn reject<S>(stream: &mut S, user: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    warn!(user = %user, "authentication failed");
    let err = SpqrError::AuthFailed(format!("password authentication failed for user \"{}\"", user));
    write_backend(
        stream,
        &BackendMessage::ErrorResponse {
            severity: "FATAL".into(),
            code: err.sqlstate().into(),
            message: err.to_string(),
        },
    )
    .await?;
    Err(err)
}

//! Connection handling for the PostgreSQL wire listener
//!
//! TLS negotiation, startup message processing, TCP keepalive, route
//! binding, and the handoff to either the forwarding loop or the admin
//! console. After TLS negotiation all handling is generic over the
//! stream type.

use super::auth::authenticate_frontend;
use super::protocol::{
    read_startup_frame, write_backend, BackendMessage, FrontendMessage, TRANSACTION_STATUS_IDLE,
};
use super::query_loop::run_query_loop;
use super::server::RouterContext;
use crate::console;
use crate::metrics;
use crate::route_pool::RouteKey;
use spqr_common::{Result, SpqrError, SslMode};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Database name that diverts a session to the admin console
pub const CONSOLE_DATABASE: &str = "spqr-console";

/// Configure TCP keepalive on a socket for faster dead connection detection
pub(crate) fn configure_tcp_keepalive(stream: &tokio::net::TcpStream, keepalive_secs: u64) {
    use socket2::SockRef;

    if let Err(e) = stream.set_nodelay(true) {
        warn!("failed to set TCP_NODELAY: {}", e);
    }

    let socket = SockRef::from(stream);

    if let Err(e) = socket.set_keepalive(true) {
        warn!("failed to enable TCP keepalive: {}", e);
        return;
    }

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(keepalive_secs))
        .with_interval(Duration::from_secs(keepalive_secs / 2 + 1));

    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        warn!("failed to configure TCP keepalive timing: {}", e);
    }
}

/// Entry point for a new client connection: negotiate TLS if requested,
/// then run the startup exchange on the resulting stream.
pub(crate) async fn handle_connection(
    mut socket: tokio::net::TcpStream,
    ctx: Arc<RouterContext>,
) -> Result<()> {
    let body = read_startup_frame(&mut socket).await?;

    match FrontendMessage::decode_startup(&body)? {
        FrontendMessage::SslRequest => {
            if let Some(acceptor) = ctx.tls_acceptor.clone() {
                debug!("SSL negotiation requested, accepting");
                socket.write_all(b"S").await?;
                socket.flush().await?;

                let tls_stream = acceptor
                    .accept(socket)
                    .await
                    .map_err(|e| SpqrError::Protocol(format!("TLS handshake failed: {}", e)))?;
                info!("TLS connection established");

                let mut tls_stream = tls_stream;
                startup_loop(&mut tls_stream, ctx, true).await
            } else {
                debug!("SSL negotiation requested, declining (no TLS material)");
                socket.write_all(b"N").await?;
                socket.flush().await?;
                startup_loop(&mut socket, ctx, false).await
            }
        }
        FrontendMessage::GssEncRequest => {
            debug!("GSSAPI negotiation requested, declining");
            socket.write_all(b"N").await?;
            socket.flush().await?;
            startup_loop(&mut socket, ctx, false).await
        }
        FrontendMessage::CancelRequest { process_id, .. } => {
            // Query cancellation is not forwarded; the running query
            // finishes on its shard.
            warn!(backend_pid = process_id, "CancelRequest received, ignoring");
            Ok(())
        }
        startup @ FrontendMessage::Startup { .. } => {
            complete_session(&mut socket, startup, ctx, false).await
        }
        other => Err(SpqrError::Protocol(format!(
            "unexpected first message {:?}",
            other
        ))),
    }
}

/// Read startup frames until a StartupMessage arrives, tolerating nested
/// SSL/GSSAPI requests, then run the session.
async fn startup_loop<S>(socket: &mut S, ctx: Arc<RouterContext>, ssl_negotiated: bool) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let body = read_startup_frame(socket).await?;
        match FrontendMessage::decode_startup(&body)? {
            FrontendMessage::SslRequest | FrontendMessage::GssEncRequest => {
                debug!("nested SSL/GSSAPI request, declining");
                socket.write_all(b"N").await?;
                socket.flush().await?;
            }
            FrontendMessage::CancelRequest { process_id, .. } => {
                warn!(backend_pid = process_id, "CancelRequest received, ignoring");
                return Ok(());
            }
            startup @ FrontendMessage::Startup { .. } => {
                return complete_session(socket, startup, ctx, ssl_negotiated).await;
            }
            other => {
                return Err(SpqrError::Protocol(format!(
                    "unexpected startup-phase message {:?}",
                    other
                )))
            }
        }
    }
}

/// Startup parameters → rule lookup → auth → greeting → query loop.
pub(crate) async fn complete_session<S>(
    socket: &mut S,
    startup: FrontendMessage,
    ctx: Arc<RouterContext>,
    ssl_negotiated: bool,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let parameters = match startup {
        FrontendMessage::Startup { parameters, .. } => parameters,
        _ => unreachable!("caller matched Startup"),
    };

    let param = |name: &str| {
        parameters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    };
    let user = param("user")
        .ok_or_else(|| SpqrError::Protocol("startup message without user".into()))?;
    let database = param("database")
        .ok_or_else(|| SpqrError::Protocol("startup message without database".into()))?;

    // Require mode refuses sessions that stayed plaintext. TLS-upgraded
    // streams re-enter through startup_loop with ssl_negotiated set.
    if ctx.ssl_policy == SslMode::Require && !ssl_negotiated && ctx.tls_acceptor.is_some() {
        let err = SpqrError::SslRequired;
        send_fatal(socket, &err).await?;
        return Err(err);
    }

    info!(user = %user, database = %database, "client connected");

    if database == CONSOLE_DATABASE {
        return console::serve(socket, ctx, &user).await;
    }

    let key = RouteKey::new(&user, &database);
    let (fr_rule, be_rule) = match ctx.rules_for(&key) {
        Some(rules) => rules,
        None => {
            let err = SpqrError::UnknownRoute {
                user: user.clone(),
                database: database.clone(),
            };
            send_fatal(socket, &SpqrError::AuthFailed(format!("unknown role \"{}\"", user)))
                .await?;
            return Err(err);
        }
    };

    authenticate_frontend(socket, &fr_rule, &user).await?;
    greet(socket).await?;

    let route = ctx.pool.match_route(key, be_rule, fr_rule).await;
    route.add_client();
    metrics::record_session_start();

    let outcome = run_query_loop(socket, &route, &ctx.map).await;

    route.remove_client();
    metrics::record_session_end();
    outcome
}

/// AuthenticationOk, server parameters, BackendKeyData, ReadyForQuery.
async fn greet<S>(socket: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_backend(socket, &BackendMessage::AuthenticationOk).await?;

    for (name, value) in [
        ("server_version", "14.5 (spqr)"),
        ("client_encoding", "UTF8"),
        ("DateStyle", "ISO, MDY"),
        ("integer_datetimes", "on"),
    ] {
        write_backend(
            socket,
            &BackendMessage::ParameterStatus {
                name: name.into(),
                value: value.into(),
            },
        )
        .await?;
    }

    let process_id = std::process::id();
    let secret_key = process_id.wrapping_mul(1103515245).wrapping_add(12345);
    write_backend(
        socket,
        &BackendMessage::BackendKeyData {
            process_id,
            secret_key,
        },
    )
    .await?;

    write_backend(
        socket,
        &BackendMessage::ReadyForQuery {
            status: TRANSACTION_STATUS_IDLE,
        },
    )
    .await?;
    Ok(())
}

async fn send_fatal<S>(socket: &mut S, err: &SpqrError) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_backend(
        socket,
        &BackendMessage::ErrorResponse {
            severity: "FATAL".into(),
            code: err.sqlstate().into(),
            message: err.to_string(),
        },
    )
    .await
}

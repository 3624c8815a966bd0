//! Per-session forwarding loop
//!
//! Each statement is routed against the current routing-map snapshot,
//! forwarded to one pooled backend connection, and the backend's frames
//! are relayed verbatim until its ReadyForQuery. While the session is
//! inside a transaction the backend stays pinned to the client; at idle
//! it returns to the pool. Routing and parse failures answer the client
//! and leave the session usable.

use super::protocol::{
    read_frame, write_backend, BackendMessage, FrontendMessage, TRANSACTION_STATUS_IDLE,
};
use crate::backend::BackendConn;
use crate::metrics;
use crate::route_pool::Route;
use spqr_common::{Result, SpqrError};
use spqr_qrouter::{parse_single_statement, RejectReason, RoutingDecision, RoutingMap};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Frames collected for one routed request: a simple Query, or an
/// extended-protocol group up to and including Sync.
struct RequestGroup {
    frames: Vec<(u8, Vec<u8>)>,
    sql: Option<String>,
}

pub(crate) async fn run_query_loop<S>(
    socket: &mut S,
    route: &Arc<Route>,
    map: &Arc<RoutingMap>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut pinned: Option<BackendConn> = None;
    let mut transaction_status = TRANSACTION_STATUS_IDLE;

    loop {
        let (tag, body) = match read_frame(socket).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("client disconnected");
                break;
            }
            Err(e) => {
                debug!(error = %e, "client read failed");
                break;
            }
        };

        let group = match tag {
            b'X' => {
                debug!("client sent Terminate");
                break;
            }
            b'Q' => {
                let sql = match FrontendMessage::decode(tag, &body)? {
                    FrontendMessage::Query(sql) => sql,
                    _ => unreachable!("tag Q decodes to Query"),
                };
                RequestGroup {
                    frames: vec![(tag, body)],
                    sql: Some(sql),
                }
            }
            b'P' | b'B' | b'E' | b'D' | b'C' | b'H' | b'S' => {
                collect_extended_group(socket, tag, body).await?
            }
            _ => {
                // Unknown tags pass through opaquely when a backend is
                // bound; without one there is nothing to forward to.
                if let Some(conn) = pinned.as_mut() {
                    conn.send_raw(tag, &body).await?;
                    continue;
                }
                respond_error(
                    socket,
                    &SpqrError::Protocol(format!("unexpected message '{}'", tag as char)),
                    transaction_status,
                )
                .await?;
                continue;
            }
        };

        // A lone Sync outside a transaction needs no backend; answer it
        // directly so error-recovering clients resynchronise.
        if pinned.is_none()
            && group.sql.is_none()
            && group.frames.len() == 1
            && group.frames[0].0 == b'S'
        {
            write_backend(
                socket,
                &BackendMessage::ReadyForQuery {
                    status: transaction_status,
                },
            )
            .await?;
            continue;
        }

        // Pinned sessions bypass routing until the transaction ends.
        let mut conn = match pinned.take() {
            Some(conn) => conn,
            None => match pick_backend(route, map, &group).await {
                Ok(conn) => conn,
                Err(e) => {
                    respond_error(socket, &e, transaction_status).await?;
                    continue;
                }
            },
        };

        // Forward the client frames, then relay the backend verbatim
        // until its ReadyForQuery closes the round trip.
        let relay: Result<u8> = async {
            for (tag, body) in &group.frames {
                conn.send_raw(*tag, body).await?;
            }
            loop {
                let (tag, body) = conn.receive_raw().await?;
                super::protocol::write_raw(socket, tag, &body).await?;
                if tag == b'Z' && !body.is_empty() {
                    socket.flush().await?;
                    return Ok(body[0]);
                }
            }
        }
        .await;

        match relay {
            Ok(status) => {
                transaction_status = status;
                if status == TRANSACTION_STATUS_IDLE {
                    route.release(conn).await;
                } else {
                    pinned = Some(conn);
                }
            }
            Err(e) => {
                warn!(error = %e, shard = %conn.shard_id(), "backend relay failed");
                route.discard(conn).await;
                transaction_status = TRANSACTION_STATUS_IDLE;
                respond_error(socket, &e, transaction_status).await?;
            }
        }
    }

    if let Some(conn) = pinned.take() {
        route.release(conn).await;
    }
    Ok(())
}

/// Read frames until Sync, remembering the first Parse's SQL for routing.
async fn collect_extended_group<S>(
    socket: &mut S,
    first_tag: u8,
    first_body: Vec<u8>,
) -> Result<RequestGroup>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut group = RequestGroup {
        frames: Vec::new(),
        sql: None,
    };

    let mut tag = first_tag;
    let mut body = first_body;
    loop {
        if tag == b'P' && group.sql.is_none() {
            if let FrontendMessage::Parse { sql, .. } = FrontendMessage::decode(tag, &body)? {
                group.sql = Some(sql);
            }
        }
        let done = tag == b'S';
        group.frames.push((tag, body));
        if done {
            return Ok(group);
        }

        match read_frame(socket).await? {
            Some((next_tag, next_body)) => {
                tag = next_tag;
                body = next_body;
            }
            None => {
                return Err(SpqrError::Protocol(
                    "client closed mid extended-protocol group".into(),
                ))
            }
        }
    }
}

/// Route the group's SQL and borrow a backend connection for it.
async fn pick_backend(
    route: &Arc<Route>,
    map: &Arc<RoutingMap>,
    group: &RequestGroup,
) -> Result<BackendConn> {
    let sql = group.sql.as_deref().ok_or_else(|| {
        SpqrError::NoRouteForStatement("extended-protocol group without Parse".into())
    })?;

    let stmt = parse_single_statement(sql)?;
    match map.snapshot().route(&stmt) {
        RoutingDecision::Single(shard_id) => {
            metrics::record_routing_decision("single");
            route.acquire(&shard_id).await
        }
        RoutingDecision::Multi(shards) => {
            metrics::record_routing_decision("multi");
            Err(SpqrError::NoRouteForStatement(format!(
                "cross-shard query not supported (would target {} shards)",
                shards.len()
            )))
        }
        RoutingDecision::Reject(reason) => {
            metrics::record_routing_decision("reject");
            Err(match reason {
                RejectReason::RangeLocked(krid) => SpqrError::RangeLocked(krid),
                other => other.to_error(sql),
            })
        }
    }
}

/// Send an ErrorResponse plus ReadyForQuery; the session stays usable.
async fn respond_error<S>(socket: &mut S, err: &SpqrError, transaction_status: u8) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_backend(
        socket,
        &BackendMessage::ErrorResponse {
            severity: "ERROR".into(),
            code: err.sqlstate().into(),
            message: err.to_string(),
        },
    )
    .await?;
    write_backend(
        socket,
        &BackendMessage::ReadyForQuery {
            status: transaction_status,
        },
    )
    .await?;
    Ok(())
}

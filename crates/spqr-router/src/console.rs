//! Admin console served to sessions on the `spqr-console` database
//!
//! A tiny fixed dialect for inspecting and mutating the routing map:
//! SHOW, CREATE SHARDING COLUMN, ADD KEY RANGE, SPLIT KEY RANGE, LOCK /
//! UNLOCK KEY RANGE, ADD SHARD, SHUTDOWN. Results are one-column row
//! sets closed by CommandComplete and ReadyForQuery.

use crate::pg_wire::protocol::{
    read_frame, write_backend, BackendMessage, FieldDescription, FrontendMessage,
    TRANSACTION_STATUS_IDLE,
};
use crate::pg_wire::server::RouterContext;
use spqr_common::{Result, SpqrError};
use spqr_qrouter::{KeyRange, Shard, ShardingRule};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

const GREETING: &str = "\n\tSPQR router admin console\n\nHere you can configure your routing rules.\n";

/// Parsed admin statement
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConsoleStmt {
    Show(ShowKind),
    CreateShardingColumn(String),
    AddKeyRange {
        lower: Vec<u8>,
        upper: Vec<u8>,
        shard_id: String,
    },
    SplitKeyRange {
        krid: String,
        bound: Vec<u8>,
    },
    LockKeyRange(String),
    UnlockKeyRange(String),
    AddShard {
        id: String,
        hosts: Vec<String>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShowKind {
    Pools,
    Databases,
    Shards,
    KeyRanges,
    ShardingColumns,
}

/// Run a console session: greeting, then one statement per Query frame.
/// Statement errors answer the client and keep the session alive.
pub async fn serve<S>(socket: &mut S, ctx: Arc<RouterContext>, user: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    info!(user = %user, "console session opened");

    write_backend(socket, &BackendMessage::AuthenticationOk).await?;
    write_backend(
        socket,
        &BackendMessage::ParameterStatus {
            name: "server_version".into(),
            value: "console".into(),
        },
    )
    .await?;
    write_backend(
        socket,
        &BackendMessage::ParameterStatus {
            name: "integer_datetimes".into(),
            value: "on".into(),
        },
    )
    .await?;
    write_backend(
        socket,
        &BackendMessage::NoticeResponse {
            severity: "NOTICE".into(),
            code: "00000".into(),
            message: GREETING.into(),
        },
    )
    .await?;
    ready(socket).await?;

    loop {
        let (tag, body) = match read_frame(socket).await? {
            Some(frame) => frame,
            None => return Ok(()),
        };

        match FrontendMessage::decode(tag, &body)? {
            FrontendMessage::Query(sql) => {
                if let Err(e) = process_query(socket, &ctx, &sql).await {
                    warn!(query = %sql, error = %e, "console statement failed");
                    write_backend(
                        socket,
                        &BackendMessage::ErrorResponse {
                            severity: "ERROR".into(),
                            code: e.sqlstate().into(),
                            message: e.to_string(),
                        },
                    )
                    .await?;
                    ready(socket).await?;
                }
            }
            FrontendMessage::Terminate => return Ok(()),
            other => {
                warn!("unexpected console message {:?}", other);
            }
        }
    }
}

async fn process_query<S>(socket: &mut S, ctx: &Arc<RouterContext>, sql: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match parse_console(sql)? {
        ConsoleStmt::Show(ShowKind::Pools) => {
            let stats = ctx.pool.stats().await;
            let rows = stats
                .iter()
                .map(|s| {
                    format!(
                        "route {}@{}: {} clients, {} idle, {} busy backends",
                        s.user, s.database, s.clients, s.idle_backends, s.busy_backends
                    )
                })
                .collect();
            send_rows(socket, "pools", rows).await
        }
        ConsoleStmt::Show(ShowKind::Databases) => {
            send_rows(socket, "databases", ctx.databases()).await
        }
        ConsoleStmt::Show(ShowKind::Shards) => {
            let snapshot = ctx.map.snapshot();
            let rows = snapshot
                .shards
                .iter()
                .map(|s| {
                    let role = if s.world { " (world)" } else { "" };
                    format!("shard {}{}: {}", s.id, role, s.hosts.join(","))
                })
                .collect();
            send_rows(socket, "shards", rows).await
        }
        ConsoleStmt::Show(ShowKind::KeyRanges) => {
            let snapshot = ctx.map.snapshot();
            let rows = snapshot
                .ranges
                .iter()
                .map(|r| {
                    let state = if r.locked { "locked" } else { "unlocked" };
                    format!(
                        "key range {} [0x{}, 0x{}) -> shard {} ({})",
                        r.id,
                        hex::encode(&r.lower),
                        hex::encode(&r.upper),
                        r.shard_id,
                        state
                    )
                })
                .collect();
            send_rows(socket, "key ranges", rows).await
        }
        ConsoleStmt::Show(ShowKind::ShardingColumns) => {
            let snapshot = ctx.map.snapshot();
            let rows = snapshot
                .rules
                .iter()
                .map(|r| format!("sharding rule on columns {}", r.columns.join(",")))
                .collect();
            send_rows(socket, "sharding columns", rows).await
        }
        ConsoleStmt::CreateShardingColumn(column) => {
            ctx.map
                .add_sharding_rule(ShardingRule::new(vec![column.clone()]))
                .await?;
            send_rows(
                socket,
                "create sharding column",
                vec![format!("created sharding column {}", column)],
            )
            .await
        }
        ConsoleStmt::AddKeyRange {
            lower,
            upper,
            shard_id,
        } => {
            let krid = uuid::Uuid::new_v4().to_string();
            let range = KeyRange::new(krid.clone(), shard_id, lower, upper)?;
            ctx.map.add_key_range(range).await?;
            send_rows(
                socket,
                "add key range",
                vec![format!("created key range {}", krid)],
            )
            .await
        }
        ConsoleStmt::SplitKeyRange { krid, bound } => {
            let (_, right) = ctx.map.split(&krid, &bound).await?;
            send_rows(
                socket,
                "split key range",
                vec![format!("split key range {}, new upper half {}", krid, right.id)],
            )
            .await
        }
        ConsoleStmt::LockKeyRange(krid) => {
            ctx.map.lock(&krid).await?;
            send_rows(
                socket,
                "lock key range",
                vec![format!("locked key range {}", krid)],
            )
            .await
        }
        ConsoleStmt::UnlockKeyRange(krid) => {
            ctx.map.unlock(&krid).await?;
            send_rows(
                socket,
                "unlock key range",
                vec![format!("unlocked key range {}", krid)],
            )
            .await
        }
        ConsoleStmt::AddShard { id, hosts } => {
            ctx.map
                .add_shard(Shard {
                    id: id.clone(),
                    hosts,
                    world: false,
                })
                .await?;
            send_rows(socket, "add shard", vec![format!("created shard {}", id)]).await
        }
        ConsoleStmt::Shutdown => {
            info!("console requested shutdown");
            let _ = ctx.shutdown.send(()).await;
            send_rows(socket, "shutdown", vec!["shutting down".into()]).await
        }
    }
}

/// One-column row set: RowDescription, DataRows, CommandComplete, Ready.
async fn send_rows<S>(socket: &mut S, header: &str, rows: Vec<String>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_backend(
        socket,
        &BackendMessage::RowDescription {
            fields: vec![FieldDescription::text(header)],
        },
    )
    .await?;

    let count = rows.len();
    for row in rows {
        write_backend(
            socket,
            &BackendMessage::DataRow {
                values: vec![Some(row.into_bytes())],
            },
        )
        .await?;
    }

    write_backend(
        socket,
        &BackendMessage::CommandComplete {
            tag: format!("SELECT {}", count),
        },
    )
    .await?;
    ready(socket).await
}

async fn ready<S>(socket: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_backend(
        socket,
        &BackendMessage::ReadyForQuery {
            status: TRANSACTION_STATUS_IDLE,
        },
    )
    .await
}

fn parse_console(sql: &str) -> Result<ConsoleStmt> {
    let trimmed = sql.trim().trim_end_matches(';');
    let tokens: Vec<&str> = trimmed.split_whitespace().collect();
    let upper: Vec<String> = tokens.iter().map(|t| t.to_uppercase()).collect();

    let bad = || SpqrError::Protocol(format!("unknown console statement: {}", trimmed));

    match upper.first().map(String::as_str) {
        Some("SHOW") if tokens.len() == 2 => {
            let kind = match upper[1].as_str() {
                "POOLS" => ShowKind::Pools,
                "DATABASES" => ShowKind::Databases,
                "SHARDS" => ShowKind::Shards,
                "KEY_RANGES" => ShowKind::KeyRanges,
                "SHARDING_COLUMNS" => ShowKind::ShardingColumns,
                _ => return Err(bad()),
            };
            Ok(ConsoleStmt::Show(kind))
        }
        Some("CREATE")
            if tokens.len() == 4 && upper[1] == "SHARDING" && upper[2] == "COLUMN" =>
        {
            Ok(ConsoleStmt::CreateShardingColumn(tokens[3].to_lowercase()))
        }
        Some("ADD") if upper.get(1).map(String::as_str) == Some("KEY") => {
            if tokens.len() != 6 || upper[2] != "RANGE" {
                return Err(bad());
            }
            Ok(ConsoleStmt::AddKeyRange {
                lower: parse_bound(tokens[3])?,
                upper: parse_bound(tokens[4])?,
                shard_id: tokens[5].to_string(),
            })
        }
        Some("ADD") if upper.get(1).map(String::as_str) == Some("SHARD") => {
            if tokens.len() < 3 {
                return Err(bad());
            }
            Ok(ConsoleStmt::AddShard {
                id: tokens[2].to_string(),
                hosts: tokens[3..].iter().map(|s| s.to_string()).collect(),
            })
        }
        Some("SPLIT")
            if tokens.len() == 6 && upper[1] == "KEY" && upper[2] == "RANGE" && upper[4] == "BY" =>
        {
            Ok(ConsoleStmt::SplitKeyRange {
                krid: tokens[3].to_string(),
                bound: parse_bound(tokens[5])?,
            })
        }
        Some("LOCK") if tokens.len() == 4 && upper[1] == "KEY" && upper[2] == "RANGE" => {
            Ok(ConsoleStmt::LockKeyRange(tokens[3].to_string()))
        }
        Some("UNLOCK") if tokens.len() == 4 && upper[1] == "KEY" && upper[2] == "RANGE" => {
            Ok(ConsoleStmt::UnlockKeyRange(tokens[3].to_string()))
        }
        Some("SHUTDOWN") if tokens.len() == 1 => Ok(ConsoleStmt::Shutdown),
        _ => Err(bad()),
    }
}

/// Key range bounds are raw bytes; only `0x`-prefixed hex is accepted,
/// anything else is rejected rather than coerced.
fn parse_bound(token: &str) -> Result<Vec<u8>> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .ok_or_else(|| {
            SpqrError::Protocol(format!(
                "key range bound {} must be a 0x-prefixed byte string",
                token
            ))
        })?;
    hex::decode(digits)
        .map_err(|_| SpqrError::Protocol(format!("bad hex in key range bound {}", token)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_show() {
        assert_eq!(
            parse_console("SHOW key_ranges").unwrap(),
            ConsoleStmt::Show(ShowKind::KeyRanges)
        );
        assert_eq!(
            parse_console("show pools;").unwrap(),
            ConsoleStmt::Show(ShowKind::Pools)
        );
        assert!(parse_console("SHOW everything").is_err());
    }

    #[test]
    fn test_parse_add_key_range() {
        assert_eq!(
            parse_console("ADD KEY RANGE 0x00 0x80 sh1").unwrap(),
            ConsoleStmt::AddKeyRange {
                lower: vec![0x00],
                upper: vec![0x80],
                shard_id: "sh1".into(),
            }
        );
        // Non-byte bounds are rejected, not coerced
        assert!(parse_console("ADD KEY RANGE 0 128 sh1").is_err());
        assert!(parse_console("ADD KEY RANGE 0x0 0x80 sh1").is_err());
    }

    #[test]
    fn test_parse_split_lock_shutdown() {
        assert_eq!(
            parse_console("SPLIT KEY RANGE kr1 BY 0x40").unwrap(),
            ConsoleStmt::SplitKeyRange {
                krid: "kr1".into(),
                bound: vec![0x40],
            }
        );
        assert_eq!(
            parse_console("LOCK KEY RANGE kr1").unwrap(),
            ConsoleStmt::LockKeyRange("kr1".into())
        );
        assert_eq!(parse_console("SHUTDOWN").unwrap(), ConsoleStmt::Shutdown);
    }

    #[test]
    fn test_parse_add_shard_with_hosts() {
        assert_eq!(
            parse_console("ADD SHARD sh3 localhost:5435 localhost:5436").unwrap(),
            ConsoleStmt::AddShard {
                id: "sh3".into(),
                hosts: vec!["localhost:5435".into(), "localhost:5436".into()],
            }
        );
    }

    #[test]
    fn test_parse_create_sharding_column() {
        assert_eq!(
            parse_console("CREATE SHARDING COLUMN Id").unwrap(),
            ConsoleStmt::CreateShardingColumn("id".into())
        );
    }
}

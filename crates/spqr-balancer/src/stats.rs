//! Per-range statistics pulled from shards
//!
//! Every shard exposes a SQL view `spqr.range_stats(lower, upper, rows,
//! bytes, reads, writes)`; the balancer queries it over the same backend
//! connection machinery the router uses.

use spqr_common::{Result, SpqrError};
use spqr_router::backend::BackendConn;
use spqr_router::pg_wire::protocol::{BackendMessage, FrontendMessage};

pub const RANGE_STATS_QUERY: &str =
    "SELECT lower, upper, rows, bytes, reads, writes FROM spqr.range_stats";

/// One row of the statistics view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeStats {
    pub lower: Vec<u8>,
    pub upper: Vec<u8>,
    pub rows: u64,
    pub bytes: u64,
    pub reads: u64,
    pub writes: u64,
}

impl RangeStats {
    /// Load metric used for balancing decisions.
    pub fn load(&self) -> f64 {
        (self.reads + self.writes) as f64
    }
}

/// Query the statistics view on an authenticated backend connection.
pub async fn fetch_range_stats(conn: &mut BackendConn) -> Result<Vec<RangeStats>> {
    conn.send(&FrontendMessage::Query(RANGE_STATS_QUERY.into()))
        .await?;

    let mut stats = Vec::new();
    loop {
        match conn.receive().await? {
            BackendMessage::DataRow { values } => stats.push(parse_stats_row(&values)?),
            BackendMessage::ReadyForQuery { .. } => return Ok(stats),
            BackendMessage::ErrorResponse { message, .. } => {
                return Err(SpqrError::Internal(format!(
                    "range_stats query failed: {}",
                    message
                )))
            }
            _ => {}
        }
    }
}

fn parse_stats_row(values: &[Option<Vec<u8>>]) -> Result<RangeStats> {
    if values.len() != 6 {
        return Err(SpqrError::Internal(format!(
            "range_stats row has {} columns, expected 6",
            values.len()
        )));
    }

    let text = |idx: usize| -> Result<String> {
        values[idx]
            .as_ref()
            .map(|v| String::from_utf8_lossy(v).to_string())
            .ok_or_else(|| SpqrError::Internal("null in range_stats row".into()))
    };
    let number = |idx: usize| -> Result<u64> {
        text(idx)?
            .parse()
            .map_err(|e| SpqrError::Internal(format!("bad number in range_stats: {}", e)))
    };

    Ok(RangeStats {
        lower: parse_bound_text(&text(0)?)?,
        upper: parse_bound_text(&text(1)?)?,
        rows: number(2)?,
        bytes: number(3)?,
        reads: number(4)?,
        writes: number(5)?,
    })
}

/// Bounds arrive as hex text, `0x`- or `\x`-prefixed.
fn parse_bound_text(text: &str) -> Result<Vec<u8>> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("\\x"))
        .unwrap_or(text);
    hex::decode(digits).map_err(|_| SpqrError::Internal(format!("bad bound in range_stats: {}", text)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(s: &str) -> Option<Vec<u8>> {
        Some(s.as_bytes().to_vec())
    }

    #[test]
    fn test_parse_stats_row() {
        let row = vec![
            cell("0x00"),
            cell("\\x80"),
            cell("1000"),
            cell("65536"),
            cell("90"),
            cell("10"),
        ];
        let stats = parse_stats_row(&row).unwrap();
        assert_eq!(stats.lower, vec![0x00]);
        assert_eq!(stats.upper, vec![0x80]);
        assert_eq!(stats.rows, 1000);
        assert_eq!(stats.load(), 100.0);
    }

    #[test]
    fn test_parse_rejects_bad_rows() {
        assert!(parse_stats_row(&[cell("0x00")]).is_err());

        let row = vec![
            cell("zz"),
            cell("0x80"),
            cell("1"),
            cell("1"),
            cell("1"),
            cell("1"),
        ];
        assert!(parse_stats_row(&row).is_err());
    }
}

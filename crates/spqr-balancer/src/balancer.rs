//! Balancer control loop: sense, decide, act
//!
//! Each cycle measures per-range load on every shard, proposes at most
//! one split or move with a greedy strategy, and applies it through the
//! coordinator under a single range lock. Failures unlock and the loop
//! continues at the next period.

use crate::coordinator_client::CoordinatorClient;
use crate::stats::{fetch_range_stats, RangeStats};
use spqr_common::{BackendRule, BalancerSettings, Result, SpqrError};
use spqr_qrouter::midpoint;
use spqr_router::backend::BackendConn;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Load attributed to one key range on its owning shard
#[derive(Debug, Clone)]
pub struct RangeLoad {
    pub krid: String,
    pub lower: Vec<u8>,
    pub upper: Vec<u8>,
    pub load: f64,
}

/// All ranges of one shard with their measured load
#[derive(Debug, Clone)]
pub struct ShardLoad {
    pub shard_id: String,
    pub ranges: Vec<RangeLoad>,
}

impl ShardLoad {
    fn total(&self) -> f64 {
        self.ranges.iter().map(|r| r.load).sum()
    }
}

/// One cycle's rebalancing proposal
#[derive(Debug, Clone, PartialEq)]
pub enum Proposal {
    Move {
        krid: String,
        to_shard: String,
    },
    Split {
        krid: String,
        bound: Vec<u8>,
    },
}

/// Greedy proposal selection.
///
/// Finds the hottest shard above the `epsilon` band and the coldest
/// below it, then picks the range on the hot shard whose load comes
/// closest to the excess without overshooting (falling back to the
/// lightest range). A range hotter than twice the fleet mean is split at
/// its byte midpoint; anything else moves to the cold shard when that
/// does not worsen variance by more than `theta`.
pub fn decide(loads: &[ShardLoad], epsilon: f64, theta: f64) -> Option<Proposal> {
    if loads.len() < 2 {
        return None;
    }

    let totals: Vec<f64> = loads.iter().map(ShardLoad::total).collect();
    let mean = totals.iter().sum::<f64>() / totals.len() as f64;

    let hot = (0..loads.len()).max_by(|a, b| totals[*a].total_cmp(&totals[*b]))?;
    let cold = (0..loads.len()).min_by(|a, b| totals[*a].total_cmp(&totals[*b]))?;

    if totals[hot] <= mean * (1.0 + epsilon) || totals[cold] >= mean * (1.0 - epsilon) {
        debug!(mean, "shard loads inside the balance band");
        return None;
    }

    let excess = totals[hot] - mean;
    let candidate = loads[hot]
        .ranges
        .iter()
        .filter(|r| r.load <= excess)
        .max_by(|a, b| a.load.total_cmp(&b.load))
        .or_else(|| {
            loads[hot]
                .ranges
                .iter()
                .min_by(|a, b| a.load.total_cmp(&b.load))
        })?;

    if candidate.load > 2.0 * mean {
        return Some(Proposal::Split {
            krid: candidate.krid.clone(),
            bound: midpoint(&candidate.lower, &candidate.upper),
        });
    }

    // Estimate post-move variance; abort when the gain is below theta.
    let variance = |totals: &[f64]| {
        let mean = totals.iter().sum::<f64>() / totals.len() as f64;
        totals.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / totals.len() as f64
    };
    let mut after = totals.clone();
    after[hot] -= candidate.load;
    after[cold] += candidate.load;

    let improvement = variance(&totals) - variance(&after);
    if improvement < theta {
        debug!(improvement, theta, "no candidate improves variance enough");
        return None;
    }

    Some(Proposal::Move {
        krid: candidate.krid.clone(),
        to_shard: loads[cold].shard_id.clone(),
    })
}

pub struct Balancer {
    client: CoordinatorClient,
    settings: BalancerSettings,
    /// Credentials presented to shards for the statistics query
    stats_rule: BackendRule,
}

impl Balancer {
    pub fn new(client: CoordinatorClient, settings: BalancerSettings, stats_rule: BackendRule) -> Self {
        Self {
            client,
            settings,
            stats_rule,
        }
    }

    /// Run cycles forever, sleeping `period` between them. Cycle errors
    /// are logged and the loop continues.
    pub async fn run(&mut self) {
        let period = Duration::from_secs(self.settings.period_secs);
        loop {
            if let Err(e) = self.cycle().await {
                warn!("balancer cycle failed: {}", e);
            }
            tokio::time::sleep(period).await;
        }
    }

    /// One sense-decide-act pass.
    pub async fn cycle(&mut self) -> Result<()> {
        if self.client.reload_required().await? {
            debug!("coordinator reports routing map changed");
        }

        let loads = self.sense().await?;
        let proposal = decide(&loads, self.settings.epsilon, self.settings.theta);

        match proposal {
            None => {
                debug!("no rebalancing proposal this cycle");
                Ok(())
            }
            Some(proposal) => self.act(proposal).await,
        }
    }

    /// Measure per-range load on every shard.
    async fn sense(&mut self) -> Result<Vec<ShardLoad>> {
        let shards = self.client.list_shards().await?;
        let ranges = self.client.list_key_ranges().await?;

        // Stats rows carry bounds; the key range ids come from the map.
        let krid_by_bounds: HashMap<(Vec<u8>, Vec<u8>), String> = ranges
            .iter()
            .map(|r| {
                (
                    (r.lower_bound.clone(), r.upper_bound.clone()),
                    r.krid.clone(),
                )
            })
            .collect();

        let mut loads = Vec::with_capacity(shards.len());
        for shard in shards {
            let host = match shard.hosts.first() {
                Some(host) => host.clone(),
                None => {
                    warn!(shard = %shard.id, "shard without hosts, skipping");
                    continue;
                }
            };

            let mut conn = BackendConn::dial(
                &shard.id,
                &host,
                &self.stats_rule,
                Duration::from_secs(10),
            )
            .await?;
            let stats = fetch_range_stats(&mut conn).await?;
            conn.close().await;

            let ranges = stats
                .iter()
                .filter_map(|s: &RangeStats| {
                    krid_by_bounds
                        .get(&(s.lower.clone(), s.upper.clone()))
                        .map(|krid| RangeLoad {
                            krid: krid.clone(),
                            lower: s.lower.clone(),
                            upper: s.upper.clone(),
                            load: s.load(),
                        })
                })
                .collect();

            loads.push(ShardLoad {
                shard_id: shard.id,
                ranges,
            });
        }
        Ok(loads)
    }

    /// Apply one proposal under a single range lock. Never holds more
    /// than one lock, so at most one route has to drain at a time.
    async fn act(&mut self, proposal: Proposal) -> Result<()> {
        let krid = match &proposal {
            Proposal::Move { krid, .. } | Proposal::Split { krid, .. } => krid.clone(),
        };

        self.client.lock(&krid).await?;

        let outcome = match &proposal {
            Proposal::Move { krid, to_shard } => {
                info!(krid = %krid, to = %to_shard, "moving key range");
                self.client.move_key_range(krid, to_shard).await
            }
            Proposal::Split { krid, bound } => {
                info!(krid = %krid, "splitting key range");
                self.client.split(krid, bound).await
            }
        };

        let unlock = self.client.unlock(&krid).await;
        match (outcome, unlock) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), _) => Err(e),
            (Ok(()), Err(e)) => Err(SpqrError::Internal(format!(
                "proposal applied but unlock failed: {}",
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(id: &str, ranges: Vec<(&str, u8, u8, f64)>) -> ShardLoad {
        ShardLoad {
            shard_id: id.into(),
            ranges: ranges
                .into_iter()
                .map(|(krid, lower, upper, load)| RangeLoad {
                    krid: krid.into(),
                    lower: vec![lower],
                    upper: vec![upper],
                    load,
                })
                .collect(),
        }
    }

    #[test]
    fn test_hot_range_moves_to_cold_shard() {
        let loads = vec![
            shard("sh1", vec![("r1", 0x00, 0x80, 100.0)]),
            shard("sh2", vec![("r2", 0x80, 0xff, 0.0)]),
        ];

        let proposal = decide(&loads, 0.1, 0.0).unwrap();
        assert_eq!(
            proposal,
            Proposal::Move {
                krid: "r1".into(),
                to_shard: "sh2".into(),
            }
        );
    }

    #[test]
    fn test_balanced_band_proposes_nothing() {
        let loads = vec![
            shard("sh1", vec![("r1", 0x00, 0x80, 52.0)]),
            shard("sh2", vec![("r2", 0x80, 0xff, 48.0)]),
        ];
        assert!(decide(&loads, 0.1, 0.0).is_none());
    }

    #[test]
    fn test_best_fitting_range_is_picked() {
        // Excess over the mean is 130; r2 (120) fits it best without
        // overshooting, so r1 stays put.
        let loads = vec![
            shard(
                "sh1",
                vec![("r1", 0x00, 0x40, 190.0), ("r2", 0x40, 0x80, 120.0)],
            ),
            shard("sh2", vec![("r3", 0x80, 0xff, 50.0)]),
        ];

        let proposal = decide(&loads, 0.1, 0.0).unwrap();
        assert_eq!(
            proposal,
            Proposal::Move {
                krid: "r2".into(),
                to_shard: "sh2".into(),
            }
        );
    }

    #[test]
    fn test_oversized_range_is_split_at_midpoint() {
        let loads = vec![
            shard("sh1", vec![("r1", 0x00, 0x80, 1000.0)]),
            shard("sh2", vec![("r2", 0x80, 0xc0, 10.0)]),
            shard("sh3", vec![("r3", 0xc0, 0xff, 10.0)]),
        ];

        match decide(&loads, 0.1, 0.0).unwrap() {
            Proposal::Split { krid, bound } => {
                assert_eq!(krid, "r1");
                assert_eq!(bound, vec![0x40]);
            }
            other => panic!("expected split, got {:?}", other),
        }
    }

    #[test]
    fn test_worsening_move_is_aborted() {
        // Moving the only movable range (100) would leave the fleet
        // more skewed than before; the cycle must propose nothing.
        let loads = vec![
            shard("sh1", vec![("r1", 0x00, 0x80, 100.0)]),
            shard("sh2", vec![("r2", 0x80, 0xff, 10.0)]),
        ];
        assert!(decide(&loads, 0.1, 0.0).is_none());
    }

    #[test]
    fn test_move_does_not_increase_variance() {
        let loads = vec![
            shard("sh1", vec![("r1", 0x00, 0x80, 100.0)]),
            shard("sh2", vec![("r2", 0x80, 0xff, 0.0)]),
        ];

        let totals: Vec<f64> = loads.iter().map(ShardLoad::total).collect();
        let variance = |v: &[f64]| {
            let mean = v.iter().sum::<f64>() / v.len() as f64;
            v.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / v.len() as f64
        };
        let before = variance(&totals);

        match decide(&loads, 0.1, 0.0).unwrap() {
            Proposal::Move { krid, .. } => {
                assert_eq!(krid, "r1");
                let after = variance(&[0.0, 100.0]);
                assert!(after <= before);
            }
            other => panic!("expected move, got {:?}", other),
        }
    }
}

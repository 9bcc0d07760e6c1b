// MIT License
// Copyright 2023--present dpot developers

//! Barrier-synchronized message passing between the coordinator and ranks.
//!
//! Every worker rank owns two channels: a command channel fed by the
//! coordinator and a reply channel drained by it. A round is
//!
//! 1. **scatter**: one [`Command::Evaluate`] per worker rank, empty shards
//!    included, so that every rank takes part;
//! 2. **gather**: exactly one [`Reply`] per worker rank, tagged with the round
//!    number and the sender's rank;
//! 3. optionally **broadcast**: one [`Command::Deliver`] per worker rank.
//!
//! The coordinator waits on each rank's own reply channel, so a rank that
//! exits mid-round shows up as a disconnected channel instead of a silent
//! hang. Anything other than one correctly tagged reply per rank is a
//! [`DpotError::Protocol`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};

use crate::batch::{EvaluationResult, ItemOutcome, WorkItem};
use crate::error::{DpotError, Result};

/// Messages from the coordinator to a worker rank.
pub(crate) enum Command {
    Evaluate { round: u64, shard: Vec<WorkItem> },
    Deliver(Delivery),
    Shutdown,
}

/// A worker rank's half of the gather step.
pub(crate) struct Reply {
    pub round: u64,
    pub rank: usize,
    pub results: Vec<EvaluationResult>,
}

/// The full, ordered outcome of a round as received by a worker rank under
/// [`DeliveryMode::BroadcastAll`](crate::config::DeliveryMode::BroadcastAll).
#[derive(Debug, Clone)]
pub struct Delivery {
    pub round: u64,
    pub results: Arc<[ItemOutcome]>,
}

/// Worker-side endpoint.
pub(crate) struct RankLink {
    rank: usize,
    commands: Receiver<Command>,
    replies: Sender<Reply>,
}

impl RankLink {
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Block for the next command. `None` once the coordinator is gone.
    pub fn recv(&self) -> Option<Command> {
        self.commands.recv().ok()
    }

    /// Send this rank's results for `round`. `false` once the coordinator is
    /// gone.
    pub fn reply(&self, round: u64, results: Vec<EvaluationResult>) -> bool {
        self.replies
            .send(Reply {
                round,
                rank: self.rank,
                results,
            })
            .is_ok()
    }
}

struct Peer {
    rank: usize,
    commands: Sender<Command>,
    replies: Receiver<Reply>,
}

/// Coordinator-side endpoint holding one [`Peer`] per worker rank.
pub(crate) struct CoordinatorLink {
    peers: Vec<Peer>,
}

/// Wire up a coordinator and `rank_count - 1` worker endpoints (ranks
/// `1..rank_count`).
pub(crate) fn link(rank_count: usize) -> (CoordinatorLink, Vec<RankLink>) {
    let (peers, ranks): (Vec<Peer>, Vec<RankLink>) = (1..rank_count)
        .map(|rank| {
            let (cmd_tx, cmd_rx) = flume::unbounded();
            let (reply_tx, reply_rx) = flume::unbounded();
            (
                Peer {
                    rank,
                    commands: cmd_tx,
                    replies: reply_rx,
                },
                RankLink {
                    rank,
                    commands: cmd_rx,
                    replies: reply_tx,
                },
            )
        })
        .unzip();
    (CoordinatorLink { peers }, ranks)
}

impl CoordinatorLink {
    /// Send each worker rank its shard. `shards` yields shards for ranks
    /// `1..R` in rank order.
    pub fn scatter<I>(&self, round: u64, shards: I) -> Result<()>
    where
        I: IntoIterator<Item = Vec<WorkItem>>,
    {
        let mut shards = shards.into_iter();
        for peer in &self.peers {
            let shard = shards.next().ok_or_else(|| {
                DpotError::protocol(round, format!("no shard prepared for rank {}", peer.rank))
            })?;
            peer.commands
                .send(Command::Evaluate { round, shard })
                .map_err(|_| {
                    DpotError::protocol(round, format!("rank {} left before scatter", peer.rank))
                })?;
        }
        if shards.next().is_some() {
            return Err(DpotError::protocol(round, "more shards than ranks"));
        }
        Ok(())
    }

    /// Collect one reply from every worker rank.
    ///
    /// With a `timeout`, the deadline is measured from `started` and covers
    /// the whole gather, not each rank individually.
    pub fn gather(
        &self,
        round: u64,
        started: Instant,
        timeout: Option<Duration>,
    ) -> Result<Vec<EvaluationResult>> {
        let deadline = timeout.map(|t| started + t);
        let mut gathered = Vec::new();
        for peer in &self.peers {
            let reply = match deadline {
                Some(deadline) => peer.replies.recv_deadline(deadline).map_err(|e| match e {
                    RecvTimeoutError::Timeout => DpotError::RoundTimeout {
                        round,
                        elapsed: started.elapsed(),
                    },
                    RecvTimeoutError::Disconnected => left_during_gather(round, peer.rank),
                })?,
                None => peer
                    .replies
                    .recv()
                    .map_err(|_| left_during_gather(round, peer.rank))?,
            };
            if reply.round != round || reply.rank != peer.rank {
                return Err(DpotError::protocol(
                    round,
                    format!(
                        "expected reply from rank {} for round {round}, got rank {} round {}",
                        peer.rank, reply.rank, reply.round
                    ),
                ));
            }
            gathered.extend(reply.results);
        }
        Ok(gathered)
    }

    /// Hand the reassembled round to every worker rank.
    pub fn broadcast(&self, delivery: &Delivery) -> Result<()> {
        for peer in &self.peers {
            peer.commands
                .send(Command::Deliver(delivery.clone()))
                .map_err(|_| {
                    DpotError::protocol(
                        delivery.round,
                        format!("rank {} left before broadcast", peer.rank),
                    )
                })?;
        }
        Ok(())
    }

    /// Ask every rank to stop. Ranks that already exited are skipped.
    pub fn shutdown(&self) {
        for peer in &self.peers {
            let _ = peer.commands.send(Command::Shutdown);
        }
    }

    /// Stop a single rank, leaving the others running.
    #[cfg(test)]
    pub fn dismiss(&self, rank: usize) {
        if let Some(peer) = self.peers.iter().find(|p| p.rank == rank) {
            let _ = peer.commands.send(Command::Shutdown);
        }
    }
}

fn left_during_gather(round: u64, rank: usize) -> DpotError {
    DpotError::protocol(round, format!("rank {rank} left before gather"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{Configuration, Evaluation, Output, Payload};

    fn shard(indices: &[usize]) -> Vec<WorkItem> {
        indices
            .iter()
            .map(|&i| WorkItem {
                original_index: i,
                payload: Payload::Single(Configuration::from(vec![i as f64])),
            })
            .collect()
    }

    fn ok(i: usize) -> EvaluationResult {
        EvaluationResult {
            original_index: i,
            outcome: Ok(Output::Single(Evaluation::energy(i as f64))),
        }
    }

    #[test]
    fn link_creates_one_endpoint_per_worker() {
        let (coord, ranks) = link(4);
        assert_eq!(coord.peers.len(), 3);
        let ids: Vec<_> = ranks.iter().map(RankLink::rank).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn scatter_then_gather_round_trip() {
        let (coord, ranks) = link(3);
        coord.scatter(1, vec![shard(&[2, 3]), shard(&[])]).unwrap();

        for r in &ranks {
            match r.recv() {
                Some(Command::Evaluate { round, shard }) => {
                    assert_eq!(round, 1);
                    let results = shard.iter().map(|w| ok(w.original_index)).collect();
                    assert!(r.reply(round, results));
                }
                _ => panic!("expected evaluate command"),
            }
        }

        let gathered = coord.gather(1, Instant::now(), None).unwrap();
        let idx: Vec<_> = gathered.iter().map(|r| r.original_index).collect();
        assert_eq!(idx, vec![2, 3]);
    }

    #[test]
    fn scatter_to_departed_rank_is_protocol_error() {
        let (coord, mut ranks) = link(3);
        ranks.pop();
        let err = coord.scatter(5, vec![shard(&[0]), shard(&[1])]).unwrap_err();
        assert!(matches!(err, DpotError::Protocol { round: 5, .. }));
    }

    #[test]
    fn scatter_requires_one_shard_per_rank() {
        let (coord, _ranks) = link(3);
        assert!(coord.scatter(1, vec![shard(&[0])]).is_err());
        let (coord, _ranks) = link(2);
        assert!(coord.scatter(1, vec![shard(&[0]), shard(&[1])]).is_err());
    }

    #[test]
    fn gather_rejects_stale_round() {
        let (coord, ranks) = link(2);
        assert!(ranks[0].reply(3, vec![ok(0)]));
        let err = coord.gather(4, Instant::now(), None).unwrap_err();
        assert!(matches!(err, DpotError::Protocol { round: 4, .. }));
    }

    #[test]
    fn gather_detects_departed_rank() {
        let (coord, ranks) = link(2);
        drop(ranks);
        let err = coord.gather(1, Instant::now(), None).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("rank 1"));
    }

    #[test]
    fn gather_times_out_on_silent_rank() {
        let (coord, _ranks) = link(2);
        let err = coord
            .gather(9, Instant::now(), Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, DpotError::RoundTimeout { round: 9, .. }));
    }

    #[test]
    fn broadcast_reaches_every_rank() {
        let (coord, ranks) = link(3);
        let delivery = Delivery {
            round: 2,
            results: vec![Ok(Output::Single(Evaluation::energy(1.0)))].into(),
        };
        coord.broadcast(&delivery).unwrap();
        for r in &ranks {
            match r.recv() {
                Some(Command::Deliver(d)) => {
                    assert_eq!(d.round, 2);
                    assert_eq!(d.results.len(), 1);
                }
                _ => panic!("expected delivery"),
            }
        }
    }

    #[test]
    fn shutdown_ignores_departed_ranks() {
        let (coord, mut ranks) = link(3);
        ranks.truncate(1);
        coord.shutdown();
        assert!(matches!(ranks[0].recv(), Some(Command::Shutdown)));
    }
}

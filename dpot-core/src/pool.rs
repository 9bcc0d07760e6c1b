// MIT License
// Copyright 2023--present dpot developers

//! The fixed group of worker ranks backing a session.
//!
//! Rank 0 is the coordinator and lives on the caller's thread; ranks
//! `1..R` each get a dedicated OS thread named `dpot-rank-<r>`. Membership is
//! fixed from [`RankPool::spawn`] until the pool is shut down or aborted.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::comm::{self, Command, CoordinatorLink, Delivery, RankLink};
use crate::error::{DpotError, Result};
use crate::potential::{evaluate_item, Potential};

struct Worker {
    rank: usize,
    handle: Option<JoinHandle<()>>,
    delivered: Arc<Mutex<Option<Delivery>>>,
}

pub struct RankPool {
    rank_count: NonZeroUsize,
    link: CoordinatorLink,
    workers: Vec<Worker>,
    potential: Arc<dyn Potential>,
    next_round: u64,
}

impl RankPool {
    /// Start ranks `1..rank_count` and wait until each one reports ready.
    pub fn spawn(rank_count: NonZeroUsize, potential: Arc<dyn Potential>) -> Result<Self> {
        let (link, rank_links) = comm::link(rank_count.get());
        let (ready_tx, ready_rx) = flume::unbounded::<usize>();

        let mut workers = Vec::with_capacity(rank_links.len());
        for rank_link in rank_links {
            let rank = rank_link.rank();
            let delivered = Arc::new(Mutex::new(None));
            let spawned = thread::Builder::new()
                .name(format!("dpot-rank-{rank}"))
                .spawn({
                    let potential = Arc::clone(&potential);
                    let delivered = Arc::clone(&delivered);
                    let ready = ready_tx.clone();
                    move || {
                        let _ = ready.send(rank);
                        drop(ready);
                        rank_main(rank_link, potential, delivered)
                    }
                });
            match spawned {
                Ok(handle) => workers.push(Worker {
                    rank,
                    handle: Some(handle),
                    delivered,
                }),
                Err(e) => {
                    // dropping `link` releases the ranks started so far
                    return Err(DpotError::Initialization(format!(
                        "cannot start rank {rank}: {e}"
                    )));
                }
            }
        }
        drop(ready_tx);

        let expected = workers.len();
        let ready = ready_rx.iter().take(expected).count();
        if ready != expected {
            link.shutdown();
            return Err(DpotError::Initialization(format!(
                "only {ready} of {expected} worker ranks came up"
            )));
        }
        debug!(ranks = rank_count.get(), "rank pool ready");

        Ok(Self {
            rank_count,
            link,
            workers,
            potential,
            next_round: 0,
        })
    }

    pub fn rank_count(&self) -> NonZeroUsize {
        self.rank_count
    }

    pub(crate) fn potential(&self) -> &dyn Potential {
        self.potential.as_ref()
    }

    pub(crate) fn link(&self) -> &CoordinatorLink {
        &self.link
    }

    pub(crate) fn begin_round(&mut self) -> u64 {
        self.next_round += 1;
        self.next_round
    }

    /// The sequence `rank` received in the latest broadcast, if any.
    pub fn delivered(&self, rank: usize) -> Option<Delivery> {
        self.workers
            .iter()
            .find(|w| w.rank == rank)
            .and_then(|w| w.delivered.lock().clone())
    }

    /// Stop every rank and wait for its thread to finish.
    pub fn shutdown(mut self) {
        self.stop(true);
    }

    /// Stop every rank without waiting. Used after a failed round, when a
    /// rank may still be stuck inside the potential; it exits as soon as it
    /// next touches its channels.
    pub fn abort(mut self) {
        self.stop(false);
    }

    fn stop(&mut self, join: bool) {
        self.link.shutdown();
        for w in &mut self.workers {
            let Some(handle) = w.handle.take() else {
                continue;
            };
            if join && handle.join().is_err() {
                warn!(rank = w.rank, "rank thread panicked");
            }
        }
    }

    /// Stop one rank, simulating a participant that leaves the group.
    #[cfg(test)]
    pub(crate) fn sever(&mut self, rank: usize) {
        self.link.dismiss(rank);
        if let Some(w) = self.workers.iter_mut().find(|w| w.rank == rank) {
            if let Some(handle) = w.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for RankPool {
    fn drop(&mut self) {
        self.stop(true);
    }
}

fn rank_main(
    link: RankLink,
    potential: Arc<dyn Potential>,
    delivered: Arc<Mutex<Option<Delivery>>>,
) {
    let rank = link.rank();
    while let Some(command) = link.recv() {
        match command {
            Command::Evaluate { round, shard } => {
                debug!(rank, round, items = shard.len(), "evaluating shard");
                let results = shard
                    .into_iter()
                    .map(|item| evaluate_item(potential.as_ref(), item))
                    .collect();
                if !link.reply(round, results) {
                    break;
                }
            }
            Command::Deliver(delivery) => {
                *delivered.lock() = Some(delivery);
            }
            Command::Shutdown => break,
        }
    }
    debug!(rank, "rank stopped");
}

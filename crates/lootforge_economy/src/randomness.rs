//! # Randomness Sources
//!
//! Opening a box is split in two: the engine asks a [`RandomnessSource`] for
//! a value and gets back only a [`RequestId`]; the value itself arrives
//! later through `LootBoxEngine::on_randomness_ready`.
//!
//! ```text
//! ┌──────────┐ request() ┌──────────────┐  (id, word)  ┌──────────┐
//! │  Engine  │ ────────▶ │    Oracle    │ ───────────▶ │  Driver  │ ──▶ on_randomness_ready
//! └──────────┘    id     └──────────────┘   channel    └──────────┘
//! ```
//!
//! Two oracles ship with the crate:
//! - [`QueuedOracle`] holds requests until the caller delivers them, in any order.
//! - [`ThreadedOracle`] answers from a worker thread over a crossbeam channel.

use alloy_primitives::U256;
use crossbeam_channel::{unbounded, Receiver, Sender};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::collections::BTreeMap;
use std::thread::JoinHandle;
use tracing::{debug, warn};

use crate::asset::RequestId;
use crate::error::{LootBoxError, LootBoxResult};

/// Issues randomness requests on behalf of the engine.
pub trait RandomnessSource: Send {
    /// Registers a request and returns its id.
    ///
    /// Ids are unique for the lifetime of the source.
    ///
    /// # Errors
    ///
    /// `RandomnessUnavailable` if the source can no longer accept requests.
    fn request(&mut self) -> LootBoxResult<RequestId>;
}

fn next_word(rng: &mut ChaCha20Rng) -> U256 {
    let mut bytes = [0u8; 32];
    rng.fill_bytes(&mut bytes);
    U256::from_be_slice(&bytes)
}

/// Deterministic oracle that queues requests until told to deliver.
///
/// The caller decides when and in which order words are produced, which
/// makes pending, duplicate and out-of-order callbacks easy to exercise.
#[derive(Debug)]
pub struct QueuedOracle {
    rng: ChaCha20Rng,
    next_id: RequestId,
    queued: BTreeMap<RequestId, U256>,
}

impl QueuedOracle {
    /// Creates an oracle seeded with `seed`.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha20Rng::seed_from_u64(seed),
            next_id: 1,
            queued: BTreeMap::new(),
        }
    }

    /// Ids still waiting for delivery, oldest first.
    #[must_use]
    pub fn queued(&self) -> Vec<RequestId> {
        self.queued.keys().copied().collect()
    }

    /// Number of undelivered requests.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    /// Removes and returns the word for `request_id`.
    pub fn take(&mut self, request_id: RequestId) -> Option<U256> {
        self.queued.remove(&request_id)
    }

    /// Removes and returns every queued request in id order.
    pub fn take_all(&mut self) -> Vec<(RequestId, U256)> {
        std::mem::take(&mut self.queued).into_iter().collect()
    }
}

impl RandomnessSource for QueuedOracle {
    fn request(&mut self) -> LootBoxResult<RequestId> {
        let id = self.next_id;
        self.next_id += 1;
        let word = next_word(&mut self.rng);
        self.queued.insert(id, word);
        debug!(request_id = id, "randomness queued");
        Ok(id)
    }
}

/// Oracle backed by a worker thread.
///
/// Each request is forwarded to the worker, which draws a word and sends
/// `(request_id, word)` on the delivery channel returned by
/// [`ThreadedOracle::new`]. Dropping the oracle closes the request channel
/// and lets the worker exit.
pub struct ThreadedOracle {
    next_id: RequestId,
    requests: Option<Sender<RequestId>>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadedOracle {
    /// Spawns the worker and returns the oracle with its delivery receiver.
    ///
    /// # Errors
    ///
    /// `RandomnessUnavailable` if the worker thread cannot be spawned.
    pub fn new(seed: u64) -> LootBoxResult<(Self, Receiver<(RequestId, U256)>)> {
        let (request_tx, request_rx) = unbounded::<RequestId>();
        let (delivery_tx, delivery_rx) = unbounded();

        let worker = std::thread::Builder::new()
            .name("lootforge-oracle".to_string())
            .spawn(move || {
                let mut rng = ChaCha20Rng::seed_from_u64(seed);
                for request_id in &request_rx {
                    let word = next_word(&mut rng);
                    if delivery_tx.send((request_id, word)).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| LootBoxError::RandomnessUnavailable(e.to_string()))?;

        Ok((
            Self {
                next_id: 1,
                requests: Some(request_tx),
                worker: Some(worker),
            },
            delivery_rx,
        ))
    }
}

impl RandomnessSource for ThreadedOracle {
    fn request(&mut self) -> LootBoxResult<RequestId> {
        let sender = self
            .requests
            .as_ref()
            .ok_or_else(|| LootBoxError::RandomnessUnavailable("oracle shut down".to_string()))?;

        let id = self.next_id;
        sender
            .send(id)
            .map_err(|_| LootBoxError::RandomnessUnavailable("oracle worker stopped".to_string()))?;
        self.next_id += 1;
        Ok(id)
    }
}

impl Drop for ThreadedOracle {
    fn drop(&mut self) {
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("oracle worker panicked");
            }
        }
    }
}

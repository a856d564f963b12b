//! Simulation context implementing ForesightContext for deterministic testing.

use async_trait::async_trait;
use foresight_env::ForesightContext;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::Instrument;

/// Mixes the master seed before combining it with a stream number
const SEED_MIX: u64 = 0x517c_c1b7_2722_0a95;

/// Simulation context backed by a virtual clock and seeded RNG streams.
///
/// This implements `ForesightContext` using:
/// - A virtual clock that only moves when the harness advances it
/// - `sleep` that parks the caller until the clock reaches its deadline
/// - Per-stream `ChaCha8Rng`s derived from one master seed
///
/// Clones share the clock.
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time since simulation start
    clock: Arc<watch::Sender<Duration>>,
}

impl SimContext {
    /// Creates a new SimContext at virtual time zero.
    pub fn new(seed: u64) -> Self {
        let (clock, _) = watch::channel(Duration::ZERO);
        Self {
            seed,
            clock: Arc::new(clock),
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Advances virtual time, waking every sleeper whose deadline passed.
    pub fn advance_time(&self, duration: Duration) {
        self.clock.send_modify(|now| *now += duration);
    }

    /// Sets the virtual time. Moving backwards wakes nobody.
    pub fn set_time(&self, time: Duration) {
        self.clock.send_replace(time);
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            clock: Arc::clone(&self.clock),
        }
    }
}

#[async_trait]
impl ForesightContext for SimContext {
    fn now(&self) -> Duration {
        *self.clock.borrow()
    }

    async fn sleep(&self, duration: Duration) {
        let mut clock = self.clock.subscribe();
        let deadline = *clock.borrow_and_update() + duration;

        while *clock.borrow_and_update() < deadline {
            if clock.changed().await.is_err() {
                return;
            }
        }
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let span = tracing::debug_span!("sim_task", name = %name);
        tokio::spawn(future.instrument(span));
    }

    fn derive_rng(&self, stream: u64) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.seed.wrapping_mul(SEED_MIX) ^ stream)
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

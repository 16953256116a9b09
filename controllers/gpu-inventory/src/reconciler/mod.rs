//! Reconciliation logic for GPU inventory records.
//!
//! This module is organized by record kind:
//! - `device`: one `GpuDevice` per discovered GPU
//! - `inventory`: one `GpuNodeInventory` per node
//! - `node`: per-node orchestration tying snapshot, devices, orphans and
//!   inventory together

pub mod device;
pub mod inventory;
pub mod node;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use detection_client::DetectionClientTrait;
use gpu_discovery::SnapshotBuilder;
use tracing::{debug, warn};

use crate::backoff::FibonacciBackoff;
use crate::config::{EffectivePolicy, PolicyConfigRef};
use crate::events::EventSink;
use crate::store::InventoryStore;

const DEFAULT_RESYNC: Duration = Duration::from_secs(300);

/// Retry directive returned by a reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Something raced with us; try again right away
    Immediate,
    /// Look at the node again after the given delay
    After(Duration),
    /// Wait for the next watch event
    Never,
}

impl Requeue {
    /// Combines the requests of one node round.
    ///
    /// Any immediate request wins, then the shortest positive delay. With no
    /// request at all, nodes with devices fall back to `resync` and nodes
    /// without devices are left to watch events.
    pub fn combine(requests: &[Requeue], has_devices: bool, resync: Duration) -> Requeue {
        if requests.contains(&Requeue::Immediate) {
            return Requeue::Immediate;
        }
        let shortest = requests
            .iter()
            .filter_map(|r| match r {
                Requeue::After(delay) if !delay.is_zero() => Some(*delay),
                _ => None,
            })
            .min();
        match shortest {
            Some(delay) => Requeue::After(delay),
            None if has_devices => Requeue::After(resync),
            None => Requeue::Never,
        }
    }
}

/// Retry delay bounds after failed node rounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorBackoff {
    /// Delay after the first failure
    pub min: Duration,
    /// Upper bound on the delay
    pub max: Duration,
}

impl Default for ErrorBackoff {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(5),
            max: Duration::from_secs(300),
        }
    }
}

/// Backoff state for a node
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

impl BackoffState {
    fn new(bounds: ErrorBackoff) -> Self {
        Self {
            backoff: FibonacciBackoff::new(bounds.min.as_secs(), bounds.max.as_secs()),
            error_count: 0,
        }
    }

    fn increment_error(&mut self) {
        self.error_count += 1;
    }

    fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}

/// Reconciles GPU device and node inventory records.
pub struct Reconciler {
    pub(crate) store: Box<dyn InventoryStore>,
    pub(crate) events: Box<dyn EventSink>,
    pub(crate) detection: Option<Box<dyn DetectionClientTrait>>,
    pub(crate) builder: SnapshotBuilder,
    pub(crate) static_policy: EffectivePolicy,
    pub(crate) policy_config: Option<PolicyConfigRef>,
    pub(crate) resync_interval: Duration,
    error_backoff: ErrorBackoff,
    /// Error count tracking per node name
    backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("static_policy", &self.static_policy)
            .field("policy_config", &self.policy_config)
            .field("resync_interval", &self.resync_interval)
            .field("detection", &self.detection.is_some())
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(
        store: impl InventoryStore + 'static,
        events: impl EventSink + 'static,
        builder: SnapshotBuilder,
        static_policy: EffectivePolicy,
    ) -> Self {
        Self {
            store: Box::new(store),
            events: Box::new(events),
            detection: None,
            builder,
            static_policy,
            policy_config: None,
            resync_interval: DEFAULT_RESYNC,
            error_backoff: ErrorBackoff::default(),
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Query per-node detection agents during reconciliation.
    #[must_use]
    pub fn with_detection(mut self, client: impl DetectionClientTrait + 'static) -> Self {
        self.detection = Some(Box::new(client));
        self
    }

    /// Read runtime policy overrides from a ConfigMap.
    #[must_use]
    pub fn with_policy_config(mut self, policy_config: Option<PolicyConfigRef>) -> Self {
        self.policy_config = policy_config;
        self
    }

    /// Delay before re-examining a node that has devices and nothing pending.
    #[must_use]
    pub fn with_resync_interval(mut self, resync_interval: Duration) -> Self {
        self.resync_interval = resync_interval;
        self
    }

    /// Bounds of the retry delay after failed rounds.
    #[must_use]
    pub fn with_error_backoff(mut self, error_backoff: ErrorBackoff) -> Self {
        self.error_backoff = error_backoff;
        self
    }

    /// Policy for this round: the ConfigMap overrides when they can be read
    /// and parsed, the static policy otherwise.
    pub(crate) async fn effective_policy(&self) -> EffectivePolicy {
        let Some(config) = &self.policy_config else {
            return self.static_policy.clone();
        };
        match self.store.get_policy_config(&config.namespace, &config.name).await {
            Ok(Some(data)) => match self.static_policy.with_overrides(&data) {
                Ok(policy) => policy,
                Err(e) => {
                    warn!(
                        "Ignoring invalid policy ConfigMap {}/{}: {}, using static policy",
                        config.namespace, config.name, e
                    );
                    self.static_policy.clone()
                }
            },
            Ok(None) => {
                debug!("Policy ConfigMap {}/{} not found, using static policy", config.namespace, config.name);
                self.static_policy.clone()
            }
            Err(e) => {
                warn!(
                    "Failed to read policy ConfigMap {}/{}: {}, using static policy",
                    config.namespace, config.name, e
                );
                self.static_policy.clone()
            }
        }
    }

    /// Get the Fibonacci backoff duration for a node based on its error count
    ///
    /// Returns (backoff_seconds, error_count)
    pub fn get_backoff_for_resource(&self, resource_key: &str) -> (u64, u32) {
        match self.backoff_states.lock() {
            Ok(mut states) => {
                let state = states
                    .entry(resource_key.to_string())
                    .or_insert_with(|| BackoffState::new(self.error_backoff));
                let backoff_seconds = state.backoff.next_backoff_seconds();
                (backoff_seconds, state.error_count)
            }
            Err(e) => {
                warn!("Failed to lock backoff_states: {}, using the backoff floor", e);
                (self.error_backoff.min.as_secs(), 0)
            }
        }
    }

    /// Increment error count for a node
    pub fn increment_error(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states
                .entry(resource_key.to_string())
                .or_insert_with(|| BackoffState::new(self.error_backoff))
                .increment_error();
        }
    }

    /// Reset error count for a node (on successful reconciliation)
    pub fn reset_error(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            if let Some(state) = states.get_mut(resource_key) {
                state.reset();
            }
        }
    }
}

//! Service directory with versioned, remove-wins endpoint slots.
//!
//! One map lock guards the whole directory; every upsert or remove touches a
//! single endpoint slot under it, so readers observe each write either fully
//! applied or not at all. Tombstones are kept for a retention period and
//! pruned by `reconcile`; pruning raises a version floor so a write stamped
//! before a pruned tombstone still loses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tierscale_state::{InstanceId, ServiceEndpoint, ServiceName};

use crate::error::DirectoryInconsistency;

/// How a service should be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolveMode {
    /// Unordered set of Ready endpoints.
    #[default]
    Pooled,
    /// Sequence indexed by ordinal, with holes.
    Ordered,
}

/// One position of an ordered resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OrdinalSlot {
    Ready { endpoint: ServiceEndpoint },
    /// The ordinal exists but is not currently Ready.
    Hole { ordinal: u32 },
}

/// Result of [`ServiceDirectory::resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "endpoints", rename_all = "snake_case")]
pub enum Resolution {
    Pooled(Vec<ServiceEndpoint>),
    Ordered(Vec<OrdinalSlot>),
}

impl Resolution {
    /// Ready endpoints regardless of mode.
    pub fn ready_endpoints(&self) -> Vec<&ServiceEndpoint> {
        match self {
            Resolution::Pooled(eps) => eps.iter().collect(),
            Resolution::Ordered(slots) => slots
                .iter()
                .filter_map(|s| match s {
                    OrdinalSlot::Ready { endpoint } => Some(endpoint),
                    OrdinalSlot::Hole { .. } => None,
                })
                .collect(),
        }
    }
}

/// What happened to an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Applied,
    /// Older than the slot's current version or a remove tombstone.
    Stale,
    /// The instance is Gone; the write is discarded.
    Retired,
}

/// How long tombstones outlive the write that laid them, unless configured.
pub const DEFAULT_TOMBSTONE_RETENTION: Duration = Duration::from_secs(300);

/// What an instance's owner reports about it during [`ServiceDirectory::reconcile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    /// No manager knows the instance.
    Unknown,
    NotReady,
    Ready,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Endpoints of instances no manager knows.
    pub purged: Vec<DirectoryInconsistency>,
    /// Visible endpoints whose instance is known but not Ready.
    pub hidden: Vec<InstanceId>,
    /// Tombstones dropped after the retention period.
    pub pruned: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TombstoneKind {
    Removed,
    /// The instance is Gone.
    Retired,
}

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    kind: TombstoneKind,
    version: u64,
    laid_at: Instant,
}

#[derive(Debug)]
struct Slot {
    published: Option<ServiceEndpoint>,
    /// A newer write waiting out the propagation delay.
    staged: Option<(ServiceEndpoint, Instant)>,
    version: u64,
}

impl Slot {
    fn effective(&self, now: Instant) -> Option<&ServiceEndpoint> {
        if let Some((endpoint, visible_at)) = &self.staged
            && *visible_at <= now
        {
            return Some(endpoint);
        }
        self.published.as_ref()
    }

    /// Whether a Ready endpoint is published or waiting to be.
    fn shows_ready(&self) -> bool {
        self.published.as_ref().is_some_and(|e| e.ready)
            || self.staged.as_ref().is_some_and(|(e, _)| e.ready)
    }

    fn promote(&mut self, now: Instant) {
        if let Some((_, visible_at)) = &self.staged
            && *visible_at <= now
        {
            self.published = self.staged.take().map(|(endpoint, _)| endpoint);
        }
    }
}

#[derive(Debug, Default)]
struct ServiceEntries {
    slots: HashMap<InstanceId, Slot>,
    tombstones: HashMap<InstanceId, Tombstone>,
    /// Number of ordinals the owning allocator has declared.
    ordinal_span: u32,
    cursor: AtomicUsize,
}

impl ServiceEntries {
    fn is_empty(&self) -> bool {
        self.slots.is_empty() && self.tombstones.is_empty() && self.ordinal_span == 0
    }
}

/// Directory of addressable endpoints keyed by service name.
pub struct ServiceDirectory {
    services: Arc<RwLock<HashMap<ServiceName, ServiceEntries>>>,
    clock: AtomicU64,
    /// Highest version of any pruned tombstone.
    floor: AtomicU64,
    propagation_delay: Duration,
    tombstone_retention: Duration,
}

impl ServiceDirectory {
    /// Create a directory whose upserts become visible after `propagation_delay`.
    pub fn new(propagation_delay: Duration) -> Self {
        Self {
            services: Arc::new(RwLock::new(HashMap::new())),
            clock: AtomicU64::new(0),
            floor: AtomicU64::new(0),
            propagation_delay,
            tombstone_retention: DEFAULT_TOMBSTONE_RETENTION,
        }
    }

    /// Keep tombstones for `retention` before `reconcile` may prune them.
    pub fn with_tombstone_retention(mut self, retention: Duration) -> Self {
        self.tombstone_retention = retention;
        self
    }

    /// Issue a version for a write that will be applied later.
    pub fn stamp(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Insert or overwrite an endpoint with a freshly issued version.
    pub fn upsert(&self, endpoint: ServiceEndpoint) -> UpsertOutcome {
        let version = self.stamp();
        self.upsert_versioned(endpoint, version)
    }

    /// Insert or overwrite an endpoint with a version obtained from [`stamp`].
    ///
    /// The write loses against any newer write to the same instance, against
    /// a remove issued after the version was stamped, and against the floor
    /// left by pruned tombstones.
    ///
    /// [`stamp`]: ServiceDirectory::stamp
    pub fn upsert_versioned(&self, endpoint: ServiceEndpoint, version: u64) -> UpsertOutcome {
        let now = Instant::now();
        let mut services = self.services.write().expect("directory lock");
        let entries = services.entry(endpoint.service.clone()).or_default();

        match entries.tombstones.get(&endpoint.instance_id) {
            Some(t) if t.kind == TombstoneKind::Retired => {
                debug!(service = %endpoint.service, instance = %endpoint.instance_id, "upsert for retired instance discarded");
                return UpsertOutcome::Retired;
            }
            Some(t) if version <= t.version => {
                debug!(service = %endpoint.service, instance = %endpoint.instance_id, version, "stale upsert lost to remove");
                return UpsertOutcome::Stale;
            }
            None if !entries.slots.contains_key(&endpoint.instance_id)
                && version <= self.floor.load(Ordering::SeqCst) =>
            {
                debug!(service = %endpoint.service, instance = %endpoint.instance_id, version, "upsert older than pruned tombstones");
                return UpsertOutcome::Stale;
            }
            _ => {}
        }
        if let Some(slot) = entries.slots.get(&endpoint.instance_id)
            && slot.version >= version
        {
            return UpsertOutcome::Stale;
        }
        entries.tombstones.remove(&endpoint.instance_id);

        let instance_id = endpoint.instance_id.clone();
        let slot = entries.slots.entry(instance_id).or_insert(Slot {
            published: None,
            staged: None,
            version: 0,
        });
        slot.promote(now);
        slot.version = version;
        if !endpoint.ready || self.propagation_delay.is_zero() {
            // Hiding an endpoint is never delayed.
            slot.published = Some(endpoint);
            slot.staged = None;
        } else {
            slot.staged = Some((endpoint, now + self.propagation_delay));
        }
        UpsertOutcome::Applied
    }

    /// Remove an endpoint immediately. Returns true if it was present.
    ///
    /// A service the directory has never seen is left alone.
    pub fn remove(&self, service: &str, instance_id: &str) -> bool {
        let version = self.stamp();
        let mut services = self.services.write().expect("directory lock");
        let Some(entries) = services.get_mut(service) else {
            debug!(%service, instance = %instance_id, "remove for unknown service ignored");
            return false;
        };
        let retired = entries
            .tombstones
            .get(instance_id)
            .is_some_and(|t| t.kind == TombstoneKind::Retired);
        if !retired {
            entries.tombstones.insert(
                instance_id.to_string(),
                Tombstone {
                    kind: TombstoneKind::Removed,
                    version,
                    laid_at: Instant::now(),
                },
            );
        }
        let existed = entries.slots.remove(instance_id).is_some();
        debug!(%service, instance = %instance_id, existed, "endpoint removed");
        existed
    }

    /// Remove an endpoint for good: its instance is Gone.
    pub fn retire(&self, service: &str, instance_id: &str) -> bool {
        let version = self.stamp();
        let mut services = self.services.write().expect("directory lock");
        let Some(entries) = services.get_mut(service) else {
            debug!(%service, instance = %instance_id, "retire for unknown service ignored");
            return false;
        };
        entries.tombstones.insert(
            instance_id.to_string(),
            Tombstone {
                kind: TombstoneKind::Retired,
                version,
                laid_at: Instant::now(),
            },
        );
        let existed = entries.slots.remove(instance_id).is_some();
        debug!(%service, instance = %instance_id, existed, "endpoint retired");
        existed
    }

    /// Declare how many ordinals a stateful service should have.
    pub fn declare_ordinals(&self, service: &str, count: u32) {
        let mut services = self.services.write().expect("directory lock");
        services.entry(service.to_string()).or_default().ordinal_span = count;
    }

    /// Resolve a service in the requested mode.
    pub fn resolve(&self, service: &str, mode: ResolveMode) -> Resolution {
        let now = Instant::now();
        let services = self.services.read().expect("directory lock");
        let Some(entries) = services.get(service) else {
            return match mode {
                ResolveMode::Pooled => Resolution::Pooled(Vec::new()),
                ResolveMode::Ordered => Resolution::Ordered(Vec::new()),
            };
        };

        match mode {
            ResolveMode::Pooled => Resolution::Pooled(
                entries
                    .slots
                    .values()
                    .filter_map(|s| s.effective(now))
                    .filter(|e| e.ready)
                    .cloned()
                    .collect(),
            ),
            ResolveMode::Ordered => {
                let visible: Vec<&ServiceEndpoint> = entries
                    .slots
                    .values()
                    .filter_map(|s| s.effective(now))
                    .filter(|e| e.ordinal.is_some())
                    .collect();
                let span = visible
                    .iter()
                    .filter_map(|e| e.ordinal)
                    .map(|o| o + 1)
                    .max()
                    .unwrap_or(0)
                    .max(entries.ordinal_span);

                let slots = (0..span)
                    .map(|ordinal| {
                        visible
                            .iter()
                            .find(|e| e.ready && e.ordinal == Some(ordinal))
                            .map(|e| OrdinalSlot::Ready {
                                endpoint: (*e).clone(),
                            })
                            .unwrap_or(OrdinalSlot::Hole { ordinal })
                    })
                    .collect();
                Resolution::Ordered(slots)
            }
        }
    }

    /// Pick one Ready endpoint of a service, round-robin.
    pub fn pick(&self, service: &str) -> Option<ServiceEndpoint> {
        let now = Instant::now();
        let services = self.services.read().expect("directory lock");
        let entries = services.get(service)?;
        let mut pool: Vec<&ServiceEndpoint> = entries
            .slots
            .values()
            .filter_map(|s| s.effective(now))
            .filter(|e| e.ready)
            .collect();
        if pool.is_empty() {
            return None;
        }
        pool.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        let idx = entries.cursor.fetch_add(1, Ordering::Relaxed) % pool.len();
        Some(pool[idx].clone())
    }

    /// Repair the directory against what the instance owners report.
    ///
    /// Endpoints of unknown instances are purged and Ready endpoints of
    /// instances that are not Ready are hidden. Only slots written at or
    /// before `watermark` are considered, so a caller stamps the watermark
    /// before it snapshots ownership. Tombstones past their retention are
    /// pruned, and services left with nothing are dropped.
    pub fn reconcile<F>(&self, watermark: u64, status: F) -> ReconcileReport
    where
        F: Fn(&str, &str) -> InstanceStatus,
    {
        let now = Instant::now();
        let mut report = ReconcileReport::default();
        let mut floor = 0;
        let mut services = self.services.write().expect("directory lock");
        for (service, entries) in services.iter_mut() {
            let stale: Vec<(InstanceId, InstanceStatus)> = entries
                .slots
                .iter()
                .filter(|(_, slot)| slot.version <= watermark)
                .filter_map(|(id, slot)| match status(service.as_str(), id.as_str()) {
                    InstanceStatus::Unknown => Some((id.clone(), InstanceStatus::Unknown)),
                    InstanceStatus::NotReady if slot.shows_ready() => {
                        Some((id.clone(), InstanceStatus::NotReady))
                    }
                    _ => None,
                })
                .collect();

            for (instance_id, owner) in stale {
                entries.slots.remove(&instance_id);
                entries.tombstones.insert(
                    instance_id.clone(),
                    Tombstone {
                        kind: TombstoneKind::Removed,
                        version: self.stamp(),
                        laid_at: now,
                    },
                );
                if owner == InstanceStatus::Unknown {
                    let inconsistency = DirectoryInconsistency {
                        service: service.clone(),
                        instance_id,
                    };
                    warn!(error = %inconsistency, "purged stale directory entry");
                    report.purged.push(inconsistency);
                } else {
                    info!(%service, instance = %instance_id, "hid endpoint of instance that is not ready");
                    report.hidden.push(instance_id);
                }
            }

            let before = entries.tombstones.len();
            entries.tombstones.retain(|_, t| {
                let keep = now.duration_since(t.laid_at) < self.tombstone_retention;
                if !keep {
                    floor = floor.max(t.version);
                }
                keep
            });
            report.pruned += before - entries.tombstones.len();
        }
        services.retain(|_, entries| !entries.is_empty());
        self.floor.fetch_max(floor, Ordering::SeqCst);
        if report.pruned > 0 {
            debug!(pruned = report.pruned, floor, "tombstones pruned");
        }
        report
    }
}

impl Default for ServiceDirectory {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(service: &str, id: &str, ordinal: Option<u32>) -> ServiceEndpoint {
        ServiceEndpoint {
            service: service.to_string(),
            instance_id: id.to_string(),
            address: format!("{id}.internal:8080"),
            ordinal,
            ready: true,
        }
    }

    fn pooled_ids(dir: &ServiceDirectory, service: &str) -> Vec<String> {
        let mut ids: Vec<String> = dir
            .resolve(service, ResolveMode::Pooled)
            .ready_endpoints()
            .into_iter()
            .map(|e| e.instance_id.clone())
            .collect();
        ids.sort();
        ids
    }

    #[test]
    fn upsert_then_resolve_includes_endpoint() {
        let dir = ServiceDirectory::default();
        assert_eq!(dir.upsert(endpoint("web", "web-1", None)), UpsertOutcome::Applied);
        assert_eq!(pooled_ids(&dir, "web"), vec!["web-1"]);
    }

    #[test]
    fn remove_then_resolve_excludes_endpoint() {
        let dir = ServiceDirectory::default();
        dir.upsert(endpoint("web", "web-1", None));
        dir.upsert(endpoint("web", "web-2", None));

        assert!(dir.remove("web", "web-1"));
        assert_eq!(pooled_ids(&dir, "web"), vec!["web-2"]);
        assert!(!dir.remove("web", "web-1"));
    }

    #[test]
    fn not_ready_endpoint_is_invisible() {
        let dir = ServiceDirectory::default();
        let mut ep = endpoint("web", "web-1", None);
        ep.ready = false;
        dir.upsert(ep);
        assert!(pooled_ids(&dir, "web").is_empty());
    }

    #[test]
    fn unknown_service_resolves_empty() {
        let dir = ServiceDirectory::default();
        assert_eq!(dir.resolve("nope", ResolveMode::Pooled), Resolution::Pooled(vec![]));
        assert_eq!(dir.resolve("nope", ResolveMode::Ordered), Resolution::Ordered(vec![]));
    }

    #[test]
    fn stale_upsert_loses_to_remove() {
        let dir = ServiceDirectory::default();
        dir.upsert(endpoint("web", "web-1", None));

        // A writer stamps its upsert, then a remove lands before it applies.
        let in_flight = dir.stamp();
        dir.remove("web", "web-1");

        let outcome = dir.upsert_versioned(endpoint("web", "web-1", None), in_flight);
        assert_eq!(outcome, UpsertOutcome::Stale);
        assert!(pooled_ids(&dir, "web").is_empty());
    }

    #[test]
    fn upsert_after_remove_is_accepted() {
        let dir = ServiceDirectory::default();
        dir.upsert(endpoint("web", "web-1", None));
        dir.remove("web", "web-1");

        // Instance became Ready again after the remove.
        assert_eq!(dir.upsert(endpoint("web", "web-1", None)), UpsertOutcome::Applied);
        assert_eq!(pooled_ids(&dir, "web"), vec!["web-1"]);
    }

    #[test]
    fn older_overwrite_is_stale() {
        let dir = ServiceDirectory::default();
        let older = dir.stamp();
        let newer = dir.stamp();

        let mut moved = endpoint("web", "web-1", None);
        moved.address = "10.0.0.9:8080".to_string();
        assert_eq!(dir.upsert_versioned(moved, newer), UpsertOutcome::Applied);
        assert_eq!(
            dir.upsert_versioned(endpoint("web", "web-1", None), older),
            UpsertOutcome::Stale
        );

        let eps = dir.resolve("web", ResolveMode::Pooled);
        assert_eq!(eps.ready_endpoints()[0].address, "10.0.0.9:8080");
    }

    #[test]
    fn retired_instance_never_comes_back() {
        let dir = ServiceDirectory::default();
        dir.upsert(endpoint("web", "web-1", None));
        assert!(dir.retire("web", "web-1"));

        assert_eq!(dir.upsert(endpoint("web", "web-1", None)), UpsertOutcome::Retired);
        // A later remove does not downgrade the tombstone.
        dir.remove("web", "web-1");
        assert_eq!(dir.upsert(endpoint("web", "web-1", None)), UpsertOutcome::Retired);
        assert!(pooled_ids(&dir, "web").is_empty());
    }

    #[test]
    fn upserts_wait_out_propagation_delay() {
        let dir = ServiceDirectory::new(Duration::from_millis(40));
        dir.upsert(endpoint("web", "web-1", None));
        assert!(pooled_ids(&dir, "web").is_empty());

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(pooled_ids(&dir, "web"), vec!["web-1"]);
    }

    #[test]
    fn removal_ignores_propagation_delay() {
        let dir = ServiceDirectory::new(Duration::from_millis(40));
        dir.upsert(endpoint("web", "web-1", None));
        std::thread::sleep(Duration::from_millis(60));

        dir.remove("web", "web-1");
        assert!(pooled_ids(&dir, "web").is_empty());
    }

    #[test]
    fn overwrite_keeps_old_value_until_propagated() {
        let dir = ServiceDirectory::new(Duration::from_millis(40));
        dir.upsert(endpoint("web", "web-1", None));
        std::thread::sleep(Duration::from_millis(60));

        let mut moved = endpoint("web", "web-1", None);
        moved.address = "10.0.0.9:8080".to_string();
        dir.upsert(moved);

        let before = dir.resolve("web", ResolveMode::Pooled);
        assert_eq!(before.ready_endpoints()[0].address, "web-1.internal:8080");

        std::thread::sleep(Duration::from_millis(60));
        let after = dir.resolve("web", ResolveMode::Pooled);
        assert_eq!(after.ready_endpoints()[0].address, "10.0.0.9:8080");
    }

    #[test]
    fn ordered_resolution_reports_holes() {
        let dir = ServiceDirectory::default();
        dir.declare_ordinals("db", 3);
        dir.upsert(endpoint("db", "db-0", Some(0)));
        dir.upsert(endpoint("db", "db-2", Some(2)));

        let Resolution::Ordered(slots) = dir.resolve("db", ResolveMode::Ordered) else {
            panic!("expected ordered resolution");
        };
        assert_eq!(slots.len(), 3);
        assert!(matches!(&slots[0], OrdinalSlot::Ready { endpoint } if endpoint.instance_id == "db-0"));
        assert_eq!(slots[1], OrdinalSlot::Hole { ordinal: 1 });
        assert!(matches!(&slots[2], OrdinalSlot::Ready { .. }));
    }

    #[test]
    fn ordered_span_covers_declared_ordinals() {
        let dir = ServiceDirectory::default();
        dir.declare_ordinals("db", 2);

        let Resolution::Ordered(slots) = dir.resolve("db", ResolveMode::Ordered) else {
            panic!("expected ordered resolution");
        };
        assert_eq!(
            slots,
            vec![OrdinalSlot::Hole { ordinal: 0 }, OrdinalSlot::Hole { ordinal: 1 }]
        );
    }

    #[test]
    fn not_ready_ordinal_is_a_hole() {
        let dir = ServiceDirectory::default();
        dir.upsert(endpoint("db", "db-0", Some(0)));
        let mut ep = endpoint("db", "db-1", Some(1));
        ep.ready = false;
        dir.upsert(ep);

        let Resolution::Ordered(slots) = dir.resolve("db", ResolveMode::Ordered) else {
            panic!("expected ordered resolution");
        };
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[1], OrdinalSlot::Hole { ordinal: 1 });
    }

    #[test]
    fn pick_round_robins() {
        let dir = ServiceDirectory::default();
        dir.upsert(endpoint("web", "web-1", None));
        dir.upsert(endpoint("web", "web-2", None));

        let picks: Vec<String> = (0..4)
            .map(|_| dir.pick("web").unwrap().instance_id)
            .collect();
        assert_eq!(picks, vec!["web-1", "web-2", "web-1", "web-2"]);
        assert!(dir.pick("nope").is_none());
    }

    fn tombstones(dir: &ServiceDirectory) -> usize {
        let services = dir.services.read().unwrap();
        services.values().map(|e| e.tombstones.len()).sum()
    }

    fn known_except(ghost: &'static str) -> impl Fn(&str, &str) -> InstanceStatus {
        move |_, id| {
            if id == ghost {
                InstanceStatus::Unknown
            } else {
                InstanceStatus::Ready
            }
        }
    }

    #[test]
    fn reconcile_purges_unknown_instances() {
        let dir = ServiceDirectory::default();
        dir.upsert(endpoint("web", "web-1", None));
        dir.upsert(endpoint("web", "ghost", None));

        let report = dir.reconcile(dir.stamp(), known_except("ghost"));
        assert_eq!(
            report.purged,
            vec![DirectoryInconsistency {
                service: "web".to_string(),
                instance_id: "ghost".to_string(),
            }]
        );
        assert!(report.hidden.is_empty());
        assert_eq!(pooled_ids(&dir, "web"), vec!["web-1"]);
        assert!(
            dir.reconcile(dir.stamp(), |_, _| InstanceStatus::Ready)
                .purged
                .is_empty()
        );
    }

    #[test]
    fn reconcile_hides_ready_endpoint_of_not_ready_instance() {
        let dir = ServiceDirectory::default();
        dir.upsert(endpoint("web", "web-1", None));
        dir.upsert(endpoint("web", "web-2", None));

        let report = dir.reconcile(dir.stamp(), |_, id| {
            if id == "web-1" {
                InstanceStatus::NotReady
            } else {
                InstanceStatus::Ready
            }
        });
        assert_eq!(report.hidden, vec!["web-1".to_string()]);
        assert!(report.purged.is_empty());
        assert_eq!(pooled_ids(&dir, "web"), vec!["web-2"]);

        // Ready again later: the next upsert is accepted.
        assert_eq!(dir.upsert(endpoint("web", "web-1", None)), UpsertOutcome::Applied);
        assert_eq!(pooled_ids(&dir, "web"), vec!["web-1", "web-2"]);
    }

    #[test]
    fn reconcile_spares_writes_after_watermark() {
        let dir = ServiceDirectory::default();
        let watermark = dir.stamp();
        // Became Ready after the owners were asked.
        dir.upsert(endpoint("web", "web-1", None));

        let report = dir.reconcile(watermark, |_, _| InstanceStatus::Unknown);
        assert_eq!(report, ReconcileReport::default());
        assert_eq!(pooled_ids(&dir, "web"), vec!["web-1"]);
    }

    #[test]
    fn tombstones_are_pruned_after_retention() {
        let dir = ServiceDirectory::default().with_tombstone_retention(Duration::from_millis(30));
        for i in 0..50 {
            let id = format!("web-{i}");
            dir.upsert(endpoint("web", &id, None));
            if i % 2 == 0 {
                dir.retire("web", &id);
            } else {
                dir.remove("web", &id);
            }
        }
        assert_eq!(tombstones(&dir), 50);

        let report = dir.reconcile(dir.stamp(), |_, _| InstanceStatus::Ready);
        assert_eq!(report.pruned, 0);
        assert_eq!(tombstones(&dir), 50);

        std::thread::sleep(Duration::from_millis(50));
        let report = dir.reconcile(dir.stamp(), |_, _| InstanceStatus::Ready);
        assert_eq!(report.pruned, 50);
        assert_eq!(tombstones(&dir), 0);
        assert!(dir.services.read().unwrap().is_empty());
    }

    #[test]
    fn pruned_remove_still_beats_older_stamp() {
        let dir = ServiceDirectory::default().with_tombstone_retention(Duration::ZERO);
        dir.upsert(endpoint("web", "web-1", None));
        let in_flight = dir.stamp();
        dir.remove("web", "web-1");

        dir.reconcile(dir.stamp(), |_, _| InstanceStatus::Ready);
        assert_eq!(tombstones(&dir), 0);

        assert_eq!(
            dir.upsert_versioned(endpoint("web", "web-1", None), in_flight),
            UpsertOutcome::Stale
        );
        assert!(pooled_ids(&dir, "web").is_empty());
        assert_eq!(dir.upsert(endpoint("web", "web-1", None)), UpsertOutcome::Applied);
    }

    #[test]
    fn remove_and_retire_ignore_unknown_services() {
        let dir = ServiceDirectory::default();
        assert!(!dir.remove("nope", "nope-1"));
        assert!(!dir.retire("nope", "nope-1"));
        assert!(dir.services.read().unwrap().is_empty());
        assert_eq!(tombstones(&dir), 0);
    }

    #[test]
    fn concurrent_writers_and_readers() {
        let dir = Arc::new(ServiceDirectory::default());
        let mut handles = Vec::new();
        for w in 0..4 {
            let dir = dir.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    let id = format!("web-{w}-{i}");
                    dir.upsert(endpoint("web", &id, None));
                    if i % 2 == 0 {
                        dir.remove("web", &id);
                    }
                    let _ = dir.resolve("web", ResolveMode::Pooled);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pooled_ids(&dir, "web").len(), 4 * 50);
    }
}

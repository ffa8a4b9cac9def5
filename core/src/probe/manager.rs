//! Probe manager
//!
//! Materializes shadow mesh bases on demand and keeps them fresh. Every
//! shadow has one [`ProbeUpdateSpecification`], persisted in the blob store
//! on each change, so scheduling outlives both the in-memory shadow and the
//! process. Concurrent requests for a shadow that does not exist yet share
//! one materialization and therefore one probe run.
//!
//! Registered as a [`PartnerResolver`] on an in-process network, the manager
//! turns any frame addressed to a known data source into a live shadow.

use super::adapter::{ProbeContext, ProbeError};
use super::coherence::CoherenceSpecification;
use super::schedule::ProbeUpdateSpecification;
use super::shadow::{ShadowListener, ShadowListeners, ShadowMeshBase};
use crate::comm::{PartnerResolver, TransportError};
use crate::context::MeshContext;
use crate::identifier::MeshBaseId;
use crate::mesh::object::{now_millis, Change};
use crate::mesh::{MeshBase, MeshBaseOptions, ShadowControl};
use crate::scheduler::TaskHandle;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, error, info, warn};

/// How a requested update went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Another run was in progress
    Skipped,
    Unchanged,
    Changed,
}

type Materialization = Arc<OnceCell<Result<Arc<ShadowMeshBase>, ProbeError>>>;

/// Handle to the probe manager; clones share the same state
#[derive(Clone)]
pub struct ProbeManager {
    inner: Arc<Inner>,
}

struct Inner {
    me: Weak<Inner>,
    ctx: MeshContext,
    shadows: Mutex<HashMap<MeshBaseId, Arc<ShadowMeshBase>>>,
    materializing: Mutex<HashMap<MeshBaseId, Materialization>>,
    schedules: Mutex<HashMap<MeshBaseId, ProbeUpdateSpecification>>,
    /// Pending scheduled run per shadow, tagged with a generation
    timers: Mutex<HashMap<MeshBaseId, (u64, TaskHandle)>>,
    next_timer: AtomicU64,
    listeners: ShadowListeners,
    workers: Semaphore,
    invocations: AtomicU64,
    running: AtomicBool,
}

impl ProbeManager {
    pub fn new(ctx: MeshContext) -> Self {
        let workers = ctx.config.probe.worker_threads.max(1);
        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            ctx,
            shadows: Mutex::new(HashMap::new()),
            materializing: Mutex::new(HashMap::new()),
            schedules: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            next_timer: AtomicU64::new(0),
            listeners: ShadowListeners::new(),
            workers: Semaphore::new(workers),
            invocations: AtomicU64::new(0),
            running: AtomicBool::new(false),
        });
        if let Some(network) = &inner.ctx.network {
            let weak: Weak<Inner> = Arc::downgrade(&inner);
            let resolver: Weak<dyn PartnerResolver> = weak;
            network.add_resolver(resolver);
        }
        Self { inner }
    }

    pub fn context(&self) -> &MeshContext {
        &self.inner.ctx
    }

    pub fn listeners(&self) -> &ShadowListeners {
        &self.inner.listeners
    }

    pub fn add_listener(&self, listener: Arc<dyn ShadowListener>) {
        self.inner.listeners.add_direct(listener);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Relaxed)
    }

    /// Restore persisted schedules and start scheduling. Past-due shadows
    /// run as soon as possible. Returns how many schedules were restored.
    pub fn start(&self) -> Result<usize, ProbeError> {
        let restored = ProbeUpdateSpecification::load_all(self.inner.ctx.storage.as_ref())?;
        self.inner.running.store(true, Ordering::Relaxed);
        let count = restored.len();
        let ids: Vec<MeshBaseId> = {
            let mut schedules = self.inner.schedules.lock();
            restored
                .into_iter()
                .map(|schedule| {
                    let id = schedule.shadow.clone();
                    schedules.insert(id.clone(), schedule);
                    id
                })
                .collect()
        };
        for id in &ids {
            self.inner.reschedule(id);
        }
        info!("Probe manager started with {} schedules", count);
        Ok(count)
    }

    /// Stop scheduling and shut every shadow down, saving its proxies.
    /// Schedules stay persisted.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::Relaxed);
        self.inner.cancel_all_timers();
        let shadows: Vec<Arc<ShadowMeshBase>> = self.inner.shadows.lock().drain().map(|(_, s)| s).collect();
        for shadow in shadows {
            shadow.mesh_base().shutdown().await;
        }
        info!("Probe manager stopped");
    }

    /// Stop at once; shadows die without saving
    pub async fn die(&self) {
        self.inner.running.store(false, Ordering::Relaxed);
        self.inner.cancel_all_timers();
        let shadows: Vec<Arc<ShadowMeshBase>> = self.inner.shadows.lock().drain().map(|(_, s)| s).collect();
        for shadow in shadows {
            shadow.mesh_base().die().await;
        }
    }

    /// The shadow for `source`, materializing it with one probe run if needed.
    /// `coherence` replaces the schedule's coherence when given.
    pub async fn obtain_shadow(
        &self,
        source: &MeshBaseId,
        coherence: Option<CoherenceSpecification>,
    ) -> Result<MeshBase, ProbeError> {
        let shadow = self.inner.obtain_shadow(source, coherence).await?;
        Ok(shadow.mesh_base().clone())
    }

    /// Run the probe now, then reschedule
    pub async fn do_update_now(&self, source: &MeshBaseId) -> Result<UpdateOutcome, ProbeError> {
        self.inner.cancel_timer(source);
        match self.inner.live_shadow(source) {
            Some(shadow) => self.inner.run(&shadow, self.inner.waits_for_ongoing(source)).await,
            None => {
                let before = self.schedule(source).and_then(|s| s.content_digest);
                self.inner.obtain_shadow(source, None).await?;
                let after = self.schedule(source).and_then(|s| s.content_digest);
                Ok(if before == after {
                    UpdateOutcome::Unchanged
                } else {
                    UpdateOutcome::Changed
                })
            }
        }
    }

    /// No further scheduled runs; explicit updates still work
    pub fn disable_future_updates(&self, source: &MeshBaseId) -> Result<(), ProbeError> {
        self.inner.cancel_timer(source);
        let found = self.inner.update_schedule(source, |schedule| schedule.stop_updating())?;
        if !found {
            return Err(ProbeError::UnknownSource(source.clone()));
        }
        info!("Scheduled updates of {} disabled", source);
        Ok(())
    }

    /// Whether a run requested during another run waits for it instead of
    /// being skipped
    pub fn set_wait_for_ongoing(&self, source: &MeshBaseId, wait: bool) -> Result<(), ProbeError> {
        let found = self.inner.update_schedule(source, |schedule| {
            schedule.wait_for_ongoing_resynchronization = wait;
        })?;
        if found {
            Ok(())
        } else {
            Err(ProbeError::UnknownSource(source.clone()))
        }
    }

    /// Release the in-memory shadow. Its schedule keeps running and
    /// materializes it again when due.
    pub async fn dispose(&self, source: &MeshBaseId) -> bool {
        let shadow = self.inner.shadows.lock().remove(source);
        match shadow {
            Some(shadow) => {
                shadow.mesh_base().shutdown().await;
                debug!("Shadow {} disposed", source);
                true
            }
            None => false,
        }
    }

    pub fn shadow(&self, source: &MeshBaseId) -> Option<MeshBase> {
        self.inner
            .live_shadow(source)
            .map(|shadow| shadow.mesh_base().clone())
    }

    pub fn shadows(&self) -> Vec<MeshBaseId> {
        let mut ids: Vec<MeshBaseId> = self.inner.shadows.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn schedule(&self, source: &MeshBaseId) -> Option<ProbeUpdateSpecification> {
        self.inner.schedules.lock().get(source).cloned()
    }

    pub fn schedules(&self) -> Vec<ProbeUpdateSpecification> {
        let mut schedules: Vec<ProbeUpdateSpecification> =
            self.inner.schedules.lock().values().cloned().collect();
        schedules.sort_by(|a, b| a.shadow.cmp(&b.shadow));
        schedules
    }

    /// Time until the next scheduled run of `source`
    pub fn next_run_in(&self, source: &MeshBaseId) -> Option<Duration> {
        self.inner
            .schedules
            .lock()
            .get(source)
            .and_then(|s| s.delay_until_next_run(now_millis()))
    }

    /// Probe reads started so far
    pub fn probe_invocations(&self) -> u64 {
        self.inner.invocations.load(Ordering::Relaxed)
    }
}

impl Inner {
    fn live_shadow(&self, id: &MeshBaseId) -> Option<Arc<ShadowMeshBase>> {
        let mut shadows = self.shadows.lock();
        match shadows.get(id) {
            Some(shadow) if shadow.mesh_base().is_alive() => Some(shadow.clone()),
            Some(_) => {
                shadows.remove(id);
                None
            }
            None => None,
        }
    }

    fn waits_for_ongoing(&self, id: &MeshBaseId) -> bool {
        self.schedules
            .lock()
            .get(id)
            .map(|s| s.wait_for_ongoing_resynchronization)
            .unwrap_or(false)
    }

    async fn obtain_shadow(
        &self,
        id: &MeshBaseId,
        coherence: Option<CoherenceSpecification>,
    ) -> Result<Arc<ShadowMeshBase>, ProbeError> {
        if let Some(shadow) = self.live_shadow(id) {
            if let Some(coherence) = coherence {
                self.adopt(id, coherence);
            }
            return Ok(shadow);
        }

        let cell = self
            .materializing
            .lock()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        let result = cell
            .get_or_init(|| self.materialize(id.clone(), coherence))
            .await
            .clone();

        let mut materializing = self.materializing.lock();
        if materializing.get(id).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
            materializing.remove(id);
        }
        result
    }

    async fn materialize(
        &self,
        id: MeshBaseId,
        coherence: Option<CoherenceSpecification>,
    ) -> Result<Arc<ShadowMeshBase>, ProbeError> {
        let probe = self.ctx.probes.resolve(&id)?;
        let now = now_millis();

        let never_ran = {
            let mut schedules = self.schedules.lock();
            if !schedules.contains_key(&id) {
                if let Some(stored) = ProbeUpdateSpecification::load(self.ctx.storage.as_ref(), &id)? {
                    schedules.insert(id.clone(), stored);
                }
            }
            let schedule = schedules.entry(id.clone()).or_insert_with(|| {
                let coherence = coherence
                    .clone()
                    .unwrap_or_else(|| self.ctx.config.probe.default_coherence.clone());
                ProbeUpdateSpecification::new(id.clone(), coherence, now)
            });
            if let Some(coherence) = coherence {
                if coherence != schedule.coherence {
                    schedule.adopt_coherence(coherence, now);
                }
            }
            schedule.save(self.ctx.storage.as_ref())?;
            schedule.probe_run_counter == 0
        };

        let control: Weak<dyn ShadowControl> = self.me.clone();
        let mesh_base = MeshBase::spawn(
            id.clone(),
            &self.ctx,
            MeshBaseOptions {
                policy: Some(self.ctx.config.probe.shadow_policy.clone()),
                writable: false,
                shadow_control: Some(control),
                // off the network until the first run has content to serve
                detached: true,
            },
        )
        .map_err(|e| ProbeError::Adapter(format!("cannot start shadow {}: {}", id, e)))?;
        let shadow = Arc::new(ShadowMeshBase::new(mesh_base, probe));

        match self.run(&shadow, true).await {
            Ok(_) => {
                self.shadows.lock().insert(id.clone(), shadow.clone());
                if let Err(e) = shadow.mesh_base().attach().await {
                    error!("Shadow {} could not be attached: {}", id, e);
                    self.shadows.lock().remove(&id);
                    shadow.mesh_base().die().await;
                    return Err(ProbeError::Adapter(format!("cannot attach shadow {}: {}", id, e)));
                }
                info!("Shadow {} materialized", id);
                Ok(shadow)
            }
            Err(e) => {
                error!("Shadow {} could not be materialized: {}", id, e);
                if never_ran {
                    self.cancel_timer(&id);
                }
                shadow.mesh_base().die().await;
                Err(e)
            }
        }
    }

    /// One probe run. The caller holds no locks.
    async fn run(&self, shadow: &ShadowMeshBase, wait: bool) -> Result<UpdateOutcome, ProbeError> {
        let id = shadow.id().clone();
        let _running = if wait {
            shadow.begin_run().await
        } else {
            match shadow.try_begin_run() {
                Some(guard) => guard,
                None => {
                    debug!("Update of {} already running, skipped", id);
                    self.listeners.fire(|l| l.update_skipped(&id));
                    return Ok(UpdateOutcome::Skipped);
                }
            }
        };
        let _worker = self
            .workers
            .acquire()
            .await
            .map_err(|_| ProbeError::Adapter("probe workers shut down".to_string()))?;

        self.listeners.fire(|l| l.update_starting(&id));
        let (run, last_digest) = self
            .schedules
            .lock()
            .get(&id)
            .map(|s| (s.probe_run_counter, s.content_digest.clone()))
            .unwrap_or((0, None));
        let probe = shadow.probe().clone();
        let started = now_millis();
        self.invocations.fetch_add(1, Ordering::Relaxed);

        let result = match probe
            .read(&id, &ProbeContext { run, last_digest: last_digest.clone() })
            .await
        {
            Ok(output) => shadow.apply_output(&output).await.map(|_| output.digest()),
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok(digest) => {
                let changed = last_digest.as_deref() != Some(digest.as_str());
                let writable = probe.is_writable();
                shadow.mesh_base().set_writable(writable);
                self.update_schedule(&id, |schedule| {
                    if changed {
                        schedule.performed_successful_run_with_change(started, probe.name(), writable, digest);
                    } else {
                        schedule.performed_successful_run_no_change(started, probe.name(), writable);
                    }
                })?;
                info!("Probe run {} of {} finished, changed: {}", run + 1, id, changed);
                self.listeners
                    .fire(|l| l.update_finished_successfully(&id, changed));
                Ok(if changed {
                    UpdateOutcome::Changed
                } else {
                    UpdateOutcome::Unchanged
                })
            }
            Err(e) => {
                warn!("Probe run {} of {} failed: {}", run + 1, id, e);
                self.update_schedule(&id, |schedule| {
                    schedule.performed_unsuccessful_run(started, probe.name(), e.to_string());
                })?;
                self.listeners
                    .fire(|l| l.update_finished_unsuccessfully(&id, &e));
                Err(e)
            }
        };
        self.reschedule(&id);
        outcome
    }

    /// Change and persist a schedule. Returns whether it exists.
    fn update_schedule(
        &self,
        id: &MeshBaseId,
        update: impl FnOnce(&mut ProbeUpdateSpecification),
    ) -> Result<bool, ProbeError> {
        let mut schedules = self.schedules.lock();
        let Some(schedule) = schedules.get_mut(id) else {
            return Ok(false);
        };
        update(schedule);
        schedule.save(self.ctx.storage.as_ref())?;
        Ok(true)
    }

    fn adopt(&self, id: &MeshBaseId, coherence: CoherenceSpecification) {
        if let Err(reason) = coherence.validate() {
            warn!("Ignoring invalid coherence for {}: {}", id, reason);
            return;
        }
        let now = now_millis();
        let adopted = self.update_schedule(id, |schedule| {
            if schedule.coherence != coherence {
                schedule.adopt_coherence(coherence, now);
            }
        });
        match adopted {
            Ok(true) => self.reschedule(id),
            Ok(false) => debug!("No schedule for {}", id),
            Err(e) => warn!("Failed to save schedule of {}: {}", id, e),
        }
    }

    fn reschedule(&self, id: &MeshBaseId) {
        if !self.running.load(Ordering::Relaxed) {
            return;
        }
        let delay = self
            .schedules
            .lock()
            .get(id)
            .and_then(|s| s.delay_until_next_run(now_millis()));
        match delay {
            Some(delay) => {
                debug!("Next probe run of {} in {:?}", id, delay);
                self.schedule_timer(id, delay);
            }
            None => self.cancel_timer(id),
        }
    }

    fn schedule_timer(&self, id: &MeshBaseId, delay: Duration) {
        let generation = self.next_timer.fetch_add(1, Ordering::Relaxed) + 1;
        let me = self.me.clone();
        let target = id.clone();
        let handle = self.ctx.scheduler.schedule_once(delay, async move {
            if let Some(inner) = me.upgrade() {
                Inner::run_scheduled(inner, target, generation).await;
            }
        });
        let previous = self.timers.lock().insert(id.clone(), (generation, handle));
        if let Some((_, previous)) = previous {
            self.ctx.scheduler.cancel(&previous);
        }
    }

    fn cancel_timer(&self, id: &MeshBaseId) {
        let removed = self.timers.lock().remove(id);
        if let Some((_, handle)) = removed {
            self.ctx.scheduler.cancel(&handle);
        }
    }

    fn cancel_all_timers(&self) {
        let timers: Vec<(u64, TaskHandle)> = self.timers.lock().drain().map(|(_, t)| t).collect();
        for (_, handle) in timers {
            self.ctx.scheduler.cancel(&handle);
        }
    }

    fn run_scheduled(self: Arc<Self>, id: MeshBaseId, generation: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            {
                let mut timers = self.timers.lock();
                match timers.get(&id) {
                    Some((current, _)) if *current == generation => {
                        timers.remove(&id);
                    }
                    _ => return,
                }
            }
            if !self.running.load(Ordering::Relaxed) {
                return;
            }
            let result = match self.live_shadow(&id) {
                Some(shadow) => {
                    let wait = self.waits_for_ongoing(&id);
                    self.run(&shadow, wait).await.map(|_| ())
                }
                None => self.obtain_shadow(&id, None).await.map(|_| ()),
            };
            if let Err(e) = result {
                debug!("Scheduled run of {} failed: {}", id, e);
            }
        })
    }
}

#[async_trait]
impl ShadowControl for Inner {
    async fn refresh(&self, shadow: &MeshBaseId) -> Result<bool, ProbeError> {
        let live = self
            .live_shadow(shadow)
            .ok_or_else(|| ProbeError::UnknownSource(shadow.clone()))?;
        self.cancel_timer(shadow);
        Ok(self.run(&live, true).await? == UpdateOutcome::Changed)
    }

    async fn write_back(&self, shadow: &MeshBaseId, changes: Vec<Change>) -> Result<(), ProbeError> {
        let live = self
            .live_shadow(shadow)
            .ok_or_else(|| ProbeError::UnknownSource(shadow.clone()))?;
        live.probe().write(shadow, &changes).await
    }

    fn adopt_coherence(&self, shadow: &MeshBaseId, coherence: CoherenceSpecification) {
        self.adopt(shadow, coherence);
    }
}

#[async_trait]
impl PartnerResolver for Inner {
    fn claims(&self, id: &MeshBaseId) -> bool {
        self.ctx.probes.find(id).is_some()
    }

    async fn resolve(&self, id: &MeshBaseId) -> Result<(), TransportError> {
        self.obtain_shadow(id, None)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Rejected(format!("data source {} failed: {}", id, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalNetwork;
    use crate::config::MeshConfig;
    use crate::identifier::MeshObjectId;
    use crate::mesh::PropertyValue;
    use crate::probe::adapter::{MemoryProbe, ProbeDirectory, ProbeOutput};
    use crate::probe::shadow::MockShadowListener;
    use crate::store::MemoryStorage;

    fn source() -> MeshBaseId {
        MeshBaseId::new("memory:feed").unwrap()
    }

    fn output(n: i64) -> ProbeOutput {
        ProbeOutput::default().object("a", [("n", PropertyValue::Integer(n))])
    }

    fn manager(probe: Arc<MemoryProbe>, storage: MemoryStorage) -> ProbeManager {
        let mut probes = ProbeDirectory::new();
        probes.register_id(source(), probe);
        let ctx = MeshContext::on_network(MeshConfig::default(), Arc::new(storage), LocalNetwork::new())
            .unwrap()
            .with_probes(probes);
        ProbeManager::new(ctx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_share_one_run() {
        let probe = Arc::new(MemoryProbe::new(output(1)));
        probe.set_latency(Duration::from_millis(100));
        let manager = manager(probe.clone(), MemoryStorage::new());

        let feed = source();
        let (a, b) = tokio::join!(
            manager.obtain_shadow(&feed, None),
            manager.obtain_shadow(&feed, None)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(probe.reads(), 1);
        assert_eq!(manager.probe_invocations(), 1);

        let item = MeshObjectId::new(source(), "a");
        assert_eq!(a.get(&item), b.get(&item));
        assert_eq!(a.get(&item).unwrap().property("n"), Some(&PropertyValue::Integer(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shadow_joins_network_after_first_run() {
        let probe = Arc::new(MemoryProbe::new(output(1)));
        probe.set_latency(Duration::from_millis(100));
        let healthy = manager(probe.clone(), MemoryStorage::new());
        let network = healthy.context().network.clone().unwrap();

        let feed = source();
        let materializing = healthy.obtain_shadow(&feed, None);
        let observed = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            network.is_attached(&feed)
        };
        let (shadow, attached_mid_run) = tokio::join!(materializing, observed);
        assert!(!attached_mid_run);
        assert!(shadow.is_ok());
        assert!(network.is_attached(&feed));

        // a failed first run never reaches the network
        let failing = Arc::new(MemoryProbe::failing(ProbeError::Io("gone".to_string())));
        let broken = manager(failing, MemoryStorage::new());
        let network = broken.context().network.clone().unwrap();
        assert!(broken.obtain_shadow(&feed, None).await.is_err());
        assert!(!network.is_attached(&feed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_schedule_picks_up_changes() {
        let probe = Arc::new(MemoryProbe::new(output(1)));
        let manager = manager(probe.clone(), MemoryStorage::new());
        manager.start().unwrap();

        let shadow = manager
            .obtain_shadow(&source(), Some(CoherenceSpecification::periodic(3000)))
            .await
            .unwrap();
        assert_eq!(manager.schedule(&source()).unwrap().probe_run_counter, 1);

        probe.set_output(output(2));
        tokio::time::sleep(Duration::from_millis(3100)).await;
        let schedule = manager.schedule(&source()).unwrap();
        assert_eq!(schedule.probe_run_counter, 2);
        assert!(schedule.last_run_successful);
        assert_eq!(
            shadow.get(&MeshObjectId::new(source(), "a")).unwrap().property("n"),
            Some(&PropertyValue::Integer(2))
        );
        manager.die().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_first_run_fails_request() {
        let probe = Arc::new(MemoryProbe::failing(ProbeError::Adapter("down".to_string())));
        let manager = manager(probe.clone(), MemoryStorage::new());
        manager.start().unwrap();

        let result = manager.obtain_shadow(&source(), None).await;
        assert_eq!(result.err(), Some(ProbeError::Adapter("down".to_string())));
        assert!(manager.shadow(&source()).is_none());

        let schedule = manager.schedule(&source()).unwrap();
        assert_eq!(schedule.probe_run_counter, 1);
        assert_eq!(schedule.last_error.as_deref(), Some("Adapter failure: down"));

        // no timer was left behind
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(probe.reads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_failure_keeps_schedule() {
        let probe = Arc::new(MemoryProbe::new(output(1)));
        let manager = manager(probe.clone(), MemoryStorage::new());
        manager.start().unwrap();
        manager
            .obtain_shadow(&source(), Some(CoherenceSpecification::periodic(1000)))
            .await
            .unwrap();

        probe.set_error(ProbeError::Io("gone".to_string()));
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let schedule = manager.schedule(&source()).unwrap();
        assert!(!schedule.last_run_successful);
        assert!(schedule.next_probe_run.is_some());

        probe.set_output(output(5));
        tokio::time::sleep(Duration::from_millis(1000)).await;
        let schedule = manager.schedule(&source()).unwrap();
        assert!(schedule.last_run_successful);
        assert_eq!(schedule.probe_run_counter, 3);
        manager.die().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_now_and_disable() {
        let probe = Arc::new(MemoryProbe::new(output(1)));
        let manager = manager(probe.clone(), MemoryStorage::new());
        manager.start().unwrap();
        manager
            .obtain_shadow(&source(), Some(CoherenceSpecification::periodic(1000)))
            .await
            .unwrap();

        assert_eq!(manager.do_update_now(&source()).await, Ok(UpdateOutcome::Unchanged));
        probe.set_output(output(2));
        assert_eq!(manager.do_update_now(&source()).await, Ok(UpdateOutcome::Changed));

        manager.disable_future_updates(&source()).unwrap();
        assert_eq!(manager.next_run_in(&source()), None);
        let reads = probe.reads();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(probe.reads(), reads);

        let unknown = MeshBaseId::new("memory:other").unwrap();
        assert_eq!(
            manager.disable_future_updates(&unknown),
            Err(ProbeError::UnknownSource(unknown))
        );
        manager.die().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_update_is_skipped() {
        let probe = Arc::new(MemoryProbe::new(output(1)));
        let manager = manager(probe.clone(), MemoryStorage::new());
        manager.obtain_shadow(&source(), None).await.unwrap();

        let mut listener = MockShadowListener::new();
        listener.expect_update_skipped().times(1).return_const(());
        listener.expect_update_starting().times(1).return_const(());
        listener
            .expect_update_finished_successfully()
            .withf(|_, changed| !changed)
            .times(1)
            .return_const(());
        manager.add_listener(Arc::new(listener));

        probe.set_latency(Duration::from_millis(500));
        let feed = source();
        let (first, second) = tokio::join!(manager.do_update_now(&feed), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            manager.do_update_now(&feed).await
        });
        assert_eq!(first, Ok(UpdateOutcome::Unchanged));
        assert_eq!(second, Ok(UpdateOutcome::Skipped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resumes_persisted_schedule() {
        let storage = MemoryStorage::new();
        let probe = Arc::new(MemoryProbe::new(output(1)));
        {
            let manager = manager(probe.clone(), storage.clone());
            manager.start().unwrap();
            manager
                .obtain_shadow(&source(), Some(CoherenceSpecification::periodic(3000)))
                .await
                .unwrap();
            manager.stop().await;
        }

        probe.set_output(output(7));
        let manager = manager(probe.clone(), storage);
        assert_eq!(manager.start().unwrap(), 1);
        assert!(manager.shadow(&source()).is_none());

        tokio::time::sleep(Duration::from_millis(3100)).await;
        let schedule = manager.schedule(&source()).unwrap();
        assert_eq!(schedule.probe_run_counter, 2);
        let shadow = manager.shadow(&source()).unwrap();
        assert_eq!(
            shadow.get(&MeshObjectId::new(source(), "a")).unwrap().property("n"),
            Some(&PropertyValue::Integer(7))
        );
        manager.die().await;
    }
}

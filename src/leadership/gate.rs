//! Leadership gate: applies externally decided leadership transitions to the
//! cluster-singleton services registered with it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::utils::ClusterBenchError;

use futures::future::BoxFuture;

use serde::{Deserialize, Serialize};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Leadership state of this node for a service group.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum LeadershipState {
    Follower,
    Leader,
}

/// Name of a cluster-singleton service group.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Serialize, Deserialize)]
pub struct ServiceGroupId(String);

impl ServiceGroupId {
    pub fn new(name: impl Into<String>) -> Self {
        ServiceGroupId(name.into())
    }
}

impl fmt::Display for ServiceGroupId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A service with at most one active instance in the cluster, living on the
/// current leader. The gate never calls `instantiate_service_instance()`
/// while a close is outstanding, nor the other way around.
pub trait SingletonService: Send + Sync {
    /// Group this service belongs to.
    fn group(&self) -> ServiceGroupId;

    /// Called when this node becomes leader.
    fn instantiate_service_instance(&self);

    /// Called when this node loses leadership. The returned future completes
    /// once the instance's resources are released.
    fn close_service_instance(
        &self,
    ) -> BoxFuture<'static, Result<(), ClusterBenchError>>;
}

/// Creates the channel through which an election collaborator feeds
/// leadership decisions into a gate. Starts as follower.
pub fn election_channel(
) -> (watch::Sender<LeadershipState>, watch::Receiver<LeadershipState>) {
    watch::channel(LeadershipState::Follower)
}

/// Registration ID type.
type GateRegId = u64;

/// Command sent from gate handles to the gate thread.
enum GateCmd {
    Register {
        id: GateRegId,
        service: Weak<dyn SingletonService>,
    },
    Unregister {
        id: GateRegId,
    },
}

/// The leadership gate module.
pub struct LeadershipGate {
    /// Logging prefix.
    me: String,

    /// Sender side of the command channel.
    tx_cmd: mpsc::UnboundedSender<GateCmd>,

    /// Receiver side of the applied-state channel; updated by the gate thread
    /// after a transition has been applied to every registered service.
    rx_applied: watch::Receiver<LeadershipState>,

    /// Next registration ID to hand out.
    next_id: AtomicU64,

    /// Gate thread join handle.
    _gate_handle: JoinHandle<()>,
}

// LeadershipGate public API implementation
impl LeadershipGate {
    /// Creates a new leadership gate fed by `rx_elect` and spawns the gate
    /// thread. Must be called within a tokio runtime.
    pub async fn new_and_setup(
        me: impl Into<String>,
        rx_elect: watch::Receiver<LeadershipState>,
    ) -> Result<Self, ClusterBenchError> {
        let me = me.into();
        let (tx_cmd, rx_cmd) = mpsc::unbounded_channel();
        let (tx_applied, rx_applied) =
            watch::channel(LeadershipState::Follower);

        let gate_handle = tokio::spawn(Self::gate_thread(
            me.clone(),
            rx_elect,
            rx_cmd,
            tx_applied,
        ));

        Ok(LeadershipGate {
            me,
            tx_cmd,
            rx_applied,
            next_id: AtomicU64::new(0),
            _gate_handle: gate_handle,
        })
    }

    /// Leadership state last applied to the registered services.
    pub fn state(&self) -> LeadershipState {
        *self.rx_applied.borrow()
    }

    /// Waits until the gate has applied leadership state `state`.
    pub async fn wait_for_state(
        &self,
        state: LeadershipState,
    ) -> Result<(), ClusterBenchError> {
        let mut rx_applied = self.rx_applied.clone();
        loop {
            if *rx_applied.borrow_and_update() == state {
                return Ok(());
            }
            rx_applied.changed().await?;
        }
    }

    /// Registers a singleton service. If this node is currently leader, the
    /// service gets instantiated right away by the gate thread. The gate only
    /// keeps a weak reference; a service dropped by its owner is pruned.
    pub fn register(
        &self,
        service: Arc<dyn SingletonService>,
    ) -> Result<GateRegistration, ClusterBenchError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let group = service.group();
        let service = Arc::downgrade(&service);
        if self.tx_cmd.send(GateCmd::Register { id, service }).is_err() {
            return logged_err!(self.me; "gate thread of '{}' is gone", group);
        }
        pf_debug!(self.me; "registered singleton '{}' as {}", group, id);

        Ok(GateRegistration {
            me: self.me.clone(),
            id,
            group,
            tx_cmd: self.tx_cmd.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

// LeadershipGate gate thread implementation
impl LeadershipGate {
    /// Closes the active instance of a service, logging failures.
    async fn close_instance(me: &str, service: &Arc<dyn SingletonService>) {
        if let Err(e) = service.close_service_instance().await {
            pf_error!(me; "error closing instance of '{}': {}",
                          service.group(), e);
        }
    }

    /// Applies a leadership transition to every registered service still
    /// alive, pruning the ones already dropped.
    async fn apply_transition(
        me: &str,
        services: &mut BTreeMap<GateRegId, Weak<dyn SingletonService>>,
        state: LeadershipState,
    ) {
        pf_info!(me; "applying leadership transition to {:?}", state);
        services.retain(|_, service| service.strong_count() > 0);
        for service in services.values() {
            let service = match service.upgrade() {
                Some(service) => service,
                None => continue, // dropped meanwhile
            };
            match state {
                LeadershipState::Leader => {
                    service.instantiate_service_instance()
                }
                LeadershipState::Follower => {
                    Self::close_instance(me, &service).await
                }
            }
        }
    }

    /// Gate thread function. Tracks the registered services and serializes all
    /// transitions and (un)registrations.
    async fn gate_thread(
        me: String,
        mut rx_elect: watch::Receiver<LeadershipState>,
        mut rx_cmd: mpsc::UnboundedReceiver<GateCmd>,
        tx_applied: watch::Sender<LeadershipState>,
    ) {
        pf_debug!(me; "gate thread spawned");

        let mut services: BTreeMap<GateRegId, Weak<dyn SingletonService>> =
            BTreeMap::new();
        let mut state = LeadershipState::Follower;
        let mut electing = true;

        // a decision may have been made before the gate got spawned
        let mut target = *rx_elect.borrow_and_update();

        loop {
            if target != state {
                Self::apply_transition(&me, &mut services, target).await;
                state = target;
                if let Err(e) = tx_applied.send(state) {
                    pf_trace!(me; "no one watching applied state: {}", e);
                }
            }

            tokio::select! {
                cmd = rx_cmd.recv() => {
                    match cmd {
                        Some(GateCmd::Register { id, service }) => {
                            if state == LeadershipState::Leader {
                                if let Some(service) = service.upgrade() {
                                    service.instantiate_service_instance();
                                }
                            }
                            services.insert(id, service);
                        }
                        Some(GateCmd::Unregister { id }) => {
                            // a dropped service released its instance itself
                            let removed = services.remove(&id);
                            if let Some(service) =
                                removed.and_then(|s| s.upgrade())
                            {
                                pf_debug!(me; "unregistered singleton '{}'",
                                              service.group());
                                if state == LeadershipState::Leader {
                                    Self::close_instance(&me, &service).await;
                                }
                            }
                        }
                        None => break, // gate and all registrations dropped
                    }
                },

                changed = rx_elect.changed(), if electing => {
                    if changed.is_ok() {
                        target = *rx_elect.borrow_and_update();
                    } else {
                        pf_warn!(me; "election source gone, stepping down");
                        electing = false;
                        target = LeadershipState::Follower;
                    }
                }
            }
        }

        if state == LeadershipState::Leader {
            Self::apply_transition(
                &me,
                &mut services,
                LeadershipState::Follower,
            )
            .await;
        }
        pf_debug!(me; "gate thread exitted");
    }
}

/// Handle of a singleton service registered with a gate. Closing removes the
/// service from the gate, closing its instance if active; it is idempotent
/// and also happens on drop.
pub struct GateRegistration {
    me: String,
    id: GateRegId,
    group: ServiceGroupId,
    tx_cmd: mpsc::UnboundedSender<GateCmd>,
    closed: AtomicBool,
}

impl GateRegistration {
    /// Group of the registered service.
    pub fn group(&self) -> &ServiceGroupId {
        &self.group
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Unregisters the service from the gate. Calling it again is a no-op.
    pub fn close(&self) -> Result<(), ClusterBenchError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.tx_cmd.send(GateCmd::Unregister { id: self.id }).is_err() {
            return logged_err!(
                self.me;
                "gate thread gone while closing '{}'",
                self.group
            );
        }
        Ok(())
    }
}

impl Drop for GateRegistration {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            pf_warn!(self.me; "dropping gate registration: {}", e);
        }
    }
}

#[cfg(test)]
mod gate_tests {
    use super::*;
    use futures::future::{self, FutureExt};
    use tokio::time::{self, Duration};

    #[derive(Default)]
    struct CountingService {
        instantiated: AtomicU64,
        closed: AtomicU64,
    }

    impl SingletonService for CountingService {
        fn group(&self) -> ServiceGroupId {
            ServiceGroupId::new("counting")
        }

        fn instantiate_service_instance(&self) {
            self.instantiated.fetch_add(1, Ordering::SeqCst);
        }

        fn close_service_instance(
            &self,
        ) -> BoxFuture<'static, Result<(), ClusterBenchError>> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            future::ready(Ok(())).boxed()
        }
    }

    async fn eventually(cond: impl Fn() -> bool) -> bool {
        for _ in 0..100 {
            if cond() {
                return true;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transitions_alternate() -> Result<(), ClusterBenchError> {
        let (tx_elect, rx_elect) = election_channel();
        let gate = LeadershipGate::new_and_setup("g", rx_elect).await?;
        let svc = Arc::new(CountingService::default());
        let _reg = gate.register(svc.clone())?;
        assert_eq!(gate.state(), LeadershipState::Follower);

        tx_elect.send(LeadershipState::Leader)?;
        gate.wait_for_state(LeadershipState::Leader).await?;
        assert_eq!(svc.instantiated.load(Ordering::SeqCst), 1);

        // repeated decision is not a transition
        tx_elect.send(LeadershipState::Leader)?;
        tx_elect.send(LeadershipState::Follower)?;
        gate.wait_for_state(LeadershipState::Follower).await?;
        assert_eq!(svc.instantiated.load(Ordering::SeqCst), 1);
        assert_eq!(svc.closed.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn register_while_leader() -> Result<(), ClusterBenchError> {
        let (tx_elect, rx_elect) = election_channel();
        tx_elect.send(LeadershipState::Leader)?;
        let gate = LeadershipGate::new_and_setup("g", rx_elect).await?;
        gate.wait_for_state(LeadershipState::Leader).await?;

        let svc = Arc::new(CountingService::default());
        let reg = gate.register(svc.clone())?;
        assert_eq!(reg.group(), &ServiceGroupId::new("counting"));
        assert!(
            eventually(|| svc.instantiated.load(Ordering::SeqCst) == 1).await
        );

        reg.close()?;
        reg.close()?;
        assert!(reg.is_closed());
        assert!(eventually(|| svc.closed.load(Ordering::SeqCst) == 1).await);

        // no longer receives transitions
        tx_elect.send(LeadershipState::Follower)?;
        gate.wait_for_state(LeadershipState::Follower).await?;
        assert_eq!(svc.closed.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn step_down_on_lost_source() -> Result<(), ClusterBenchError> {
        let (tx_elect, rx_elect) = election_channel();
        let gate = LeadershipGate::new_and_setup("g", rx_elect).await?;
        let svc = Arc::new(CountingService::default());
        let _reg = gate.register(svc.clone())?;

        tx_elect.send(LeadershipState::Leader)?;
        gate.wait_for_state(LeadershipState::Leader).await?;
        drop(tx_elect);
        gate.wait_for_state(LeadershipState::Follower).await?;
        assert_eq!(svc.closed.load(Ordering::SeqCst), 1);
        Ok(())
    }
}

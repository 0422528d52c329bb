//! In-process notification broker: a bounded queue drained by a dispatcher
//! thread that fans every notification out to all registered listeners.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::rpc::PayloadItem;
use crate::utils::{lock, ClusterBenchError};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// A published notification. The payload is shared, not copied, among
/// listeners and repeated publications.
#[derive(Debug, Clone)]
pub struct Notification {
    payload: Arc<Vec<PayloadItem>>,
}

impl Notification {
    pub fn new(payload: Vec<PayloadItem>) -> Self {
        Notification {
            payload: Arc::new(payload),
        }
    }

    pub fn payload(&self) -> &[PayloadItem] {
        &self.payload
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// A subscriber of broker notifications. Called on the dispatcher thread,
/// so it must not block.
pub trait NotificationListener: Send + Sync {
    fn on_notification(&self, ntf: &Notification);
}

/// Completes once an accepted notification has been handed to every
/// listener registered at dispatch time.
pub struct DeliveryFuture(oneshot::Receiver<()>);

impl DeliveryFuture {
    pub async fn delivered(self) -> Result<(), ClusterBenchError> {
        self.0.await?;
        Ok(())
    }
}

/// Outcome of a non-blocking publish.
pub enum OfferResult {
    Accepted(DeliveryFuture),

    /// Queue full; the notification was dropped.
    Rejected,
}

impl OfferResult {
    pub fn is_rejected(&self) -> bool {
        matches!(self, OfferResult::Rejected)
    }
}

/// Queue entry.
struct QueuedNtf {
    ntf: Notification,
    tx_done: Option<oneshot::Sender<()>>,
}

type ListenerId = u64;
type ListenerWriter =
    flashmap::WriteHandle<ListenerId, Arc<dyn NotificationListener>>;
type ListenerReader =
    flashmap::ReadHandle<ListenerId, Arc<dyn NotificationListener>>;

/// The notification broker module.
pub struct NotificationBroker {
    me: String,

    /// Sender side of the bounded notification queue.
    tx_queue: mpsc::Sender<QueuedNtf>,

    /// Write handle of the listener table, shared with registrations.
    listeners: Arc<Mutex<ListenerWriter>>,

    next_id: AtomicU64,

    /// Dispatcher thread join handle.
    _dispatcher_handle: JoinHandle<()>,
}

// NotificationBroker public API implementation
impl NotificationBroker {
    /// Creates a broker with a queue of `queue_cap` notifications and spawns
    /// its dispatcher thread.
    pub async fn new_and_setup(
        me: impl Into<String>,
        queue_cap: usize,
    ) -> Result<Self, ClusterBenchError> {
        let me = me.into();
        if queue_cap == 0 {
            return logged_err!(me; "invalid queue capacity {}", queue_cap);
        }

        let (tx_queue, rx_queue) = mpsc::channel(queue_cap);
        let (listeners_w, listeners_r) =
            flashmap::new::<ListenerId, Arc<dyn NotificationListener>>();

        let dispatcher_handle = tokio::spawn(Self::dispatcher_thread(
            me.clone(),
            rx_queue,
            listeners_r,
        ));

        Ok(NotificationBroker {
            me,
            tx_queue,
            listeners: Arc::new(Mutex::new(listeners_w)),
            next_id: AtomicU64::new(0),
            _dispatcher_handle: dispatcher_handle,
        })
    }

    /// Subscribes a listener until the returned registration is closed.
    pub fn register_listener(
        &self,
        listener: Arc<dyn NotificationListener>,
    ) -> ListenerRegistration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut writer = lock(&self.listeners);
            let mut guard = writer.guard();
            guard.insert(id, listener);
            guard.publish();
        }
        pf_debug!(self.me; "registered listener {}", id);

        ListenerRegistration {
            me: self.me.clone(),
            id,
            listeners: self.listeners.clone(),
            closed: AtomicBool::new(false),
        }
    }

    /// Publishes a notification, waiting for queue space if needed.
    pub async fn put_notification(
        &self,
        ntf: Notification,
    ) -> Result<(), ClusterBenchError> {
        self.tx_queue
            .send(QueuedNtf { ntf, tx_done: None })
            .await
            .map_err(|e| ClusterBenchError::msg(e.to_string()))
    }

    /// Publishes a notification only if the queue has room right now.
    /// Fails if the broker has shut down.
    pub fn offer_notification(
        &self,
        ntf: Notification,
    ) -> Result<OfferResult, ClusterBenchError> {
        let (tx_done, rx_done) = oneshot::channel();
        match self.tx_queue.try_send(QueuedNtf {
            ntf,
            tx_done: Some(tx_done),
        }) {
            Ok(()) => Ok(OfferResult::Accepted(DeliveryFuture(rx_done))),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(OfferResult::Rejected),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                logged_err!(self.me; "notification queue closed")
            }
        }
    }

    /// Number of free slots in the queue.
    pub fn queue_room(&self) -> usize {
        self.tx_queue.capacity()
    }
}

// NotificationBroker dispatcher thread implementation
impl NotificationBroker {
    async fn dispatcher_thread(
        me: String,
        mut rx_queue: mpsc::Receiver<QueuedNtf>,
        listeners: ListenerReader,
    ) {
        pf_debug!(me; "dispatcher thread spawned");

        while let Some(QueuedNtf { ntf, tx_done }) = rx_queue.recv().await {
            {
                let guard = listeners.guard();
                for (_, listener) in guard.iter() {
                    listener.on_notification(&ntf);
                }
            }
            if let Some(tx_done) = tx_done {
                // the publisher may not care to wait
                let _ = tx_done.send(());
            }
        }

        pf_debug!(me; "dispatcher thread exitted");
    }
}

/// Handle of a listener subscription. Closing is idempotent and also
/// happens on drop.
pub struct ListenerRegistration {
    me: String,
    id: ListenerId,
    listeners: Arc<Mutex<ListenerWriter>>,
    closed: AtomicBool,
}

impl ListenerRegistration {
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = lock(&self.listeners);
        let mut guard = writer.guard();
        guard.remove(self.id);
        guard.publish();
        pf_debug!(self.me; "unregistered listener {}", self.id);
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod notification_tests {
    use super::*;
    use crate::rpc::make_payload;

    #[derive(Default)]
    struct Tally(AtomicU64);

    impl NotificationListener for Tally {
        fn on_notification(&self, ntf: &Notification) {
            self.0.fetch_add(ntf.size() as u64, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fan_out() -> Result<(), ClusterBenchError> {
        let broker = NotificationBroker::new_and_setup("n", 16).await?;
        assert_eq!(broker.queue_room(), 16);
        let a = Arc::new(Tally::default());
        let b = Arc::new(Tally::default());
        let _reg_a = broker.register_listener(a.clone());
        let reg_b = broker.register_listener(b.clone());

        broker.put_notification(Notification::new(make_payload(3))).await?;
        match broker.offer_notification(Notification::new(make_payload(2)))? {
            OfferResult::Accepted(delivery) => delivery.delivered().await?,
            OfferResult::Rejected => panic!("offer rejected on empty queue"),
        }
        assert_eq!(a.0.load(Ordering::SeqCst), 5);
        assert_eq!(b.0.load(Ordering::SeqCst), 5);

        reg_b.close();
        reg_b.close();
        match broker.offer_notification(Notification::new(make_payload(1)))? {
            OfferResult::Accepted(delivery) => delivery.delivered().await?,
            OfferResult::Rejected => panic!("offer rejected on empty queue"),
        }
        assert_eq!(a.0.load(Ordering::SeqCst), 6);
        assert_eq!(b.0.load(Ordering::SeqCst), 5);
        Ok(())
    }

    /// Blocks the dispatcher until released.
    struct Gate(std::sync::Mutex<()>);

    impl NotificationListener for Gate {
        fn on_notification(&self, _ntf: &Notification) {
            drop(lock(&self.0));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn offer_rejects_when_full() -> Result<(), ClusterBenchError> {
        let broker = NotificationBroker::new_and_setup("n", 2).await?;
        let gate = Arc::new(Gate(std::sync::Mutex::new(())));
        let _reg = broker.register_listener(gate.clone());

        let held = lock(&gate.0);
        let mut rejected = 0;
        for _ in 0..10 {
            if broker
                .offer_notification(Notification::new(make_payload(1)))?
                .is_rejected()
            {
                rejected += 1;
            }
        }
        // at most one in the dispatcher plus two queued
        assert!(rejected >= 7);
        assert_eq!(broker.queue_room(), 0);
        drop(held);
        Ok(())
    }
}

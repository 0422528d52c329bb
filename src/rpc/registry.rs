//! Local RPC service registry and call dispatch.
//!
//! Handlers live in two read-optimized tables: one keyed by service identity
//! for global implementations, one keyed by (service, route) for routed ones.
//! Writes happen only on (de)registration and are serialized through a mutex
//! around the single write handle; every invoker owns its own read handle and
//! never blocks on writers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::rpc::{RouteId, RpcOutput, RpcRequest, ServiceId};
use crate::utils::{lock, ClusterBenchError};

use async_trait::async_trait;

use futures::future::{self, BoxFuture, FutureExt};

/// An RPC implementation that can be registered to the registry.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Serves one call.
    async fn handle(
        &self,
        req: RpcRequest,
    ) -> Result<RpcOutput, ClusterBenchError>;
}

/// Shared reference to a registered handler.
pub type HandlerRef = Arc<dyn RpcHandler>;

/// Registration ID type.
type RegId = u64;

/// Table entry: the handler plus the registration owning it.
struct Slot {
    reg: RegId,
    handler: HandlerRef,
}

type TableWriter = flashmap::WriteHandle<String, Slot>;
type TableReader = flashmap::ReadHandle<String, Slot>;

/// Key of a routed table entry.
fn route_key(service: &ServiceId, route: &str) -> String {
    format!("{}#{}", service.as_str(), route)
}

fn lookup_in(table: &TableReader, key: &String) -> Option<HandlerRef> {
    table.guard().get(key).map(|slot| slot.handler.clone())
}

/// State shared by the registry and all registrations made through it.
struct RegistryCore {
    /// Logging prefix.
    me: String,

    /// Global implementations keyed by service identity.
    globals_w: Mutex<TableWriter>,
    globals_r: Mutex<TableReader>,

    /// Routed implementations keyed by `route_key()`.
    routes_w: Mutex<TableWriter>,
    routes_r: Mutex<TableReader>,

    /// Next registration ID to hand out.
    next_reg: AtomicU64,
}

impl RegistryCore {
    fn new_reg_id(&self) -> RegId {
        self.next_reg.fetch_add(1, Ordering::Relaxed)
    }

    fn insert_global(
        &self,
        service: &ServiceId,
        reg: RegId,
        handler: HandlerRef,
    ) -> Result<(), ClusterBenchError> {
        let mut writer = lock(&self.globals_w);
        let mut guard = writer.guard();
        let key = service.to_string();
        if guard.get(&key).is_some() {
            return logged_err!(self.me; "service '{}' already registered", service);
        }
        guard.insert(key, Slot { reg, handler });
        guard.publish();
        Ok(())
    }

    /// Removes the global entry of `service` only if it is still owned by
    /// registration `reg`.
    fn remove_global(&self, service: &ServiceId, reg: RegId) -> bool {
        let mut writer = lock(&self.globals_w);
        let mut guard = writer.guard();
        let key = service.to_string();
        let owned = guard.get(&key).map_or(false, |slot| slot.reg == reg);
        if owned {
            guard.remove(key);
        }
        guard.publish();
        owned
    }

    fn insert_route(
        &self,
        service: &ServiceId,
        route: &str,
        reg: RegId,
        handler: HandlerRef,
    ) -> Result<(), ClusterBenchError> {
        let mut writer = lock(&self.routes_w);
        let mut guard = writer.guard();
        let key = route_key(service, route);
        match guard.get(&key).map(|slot| slot.reg) {
            Some(owner) if owner == reg => return Ok(()),
            Some(_) => {
                return logged_err!(
                    self.me;
                    "route '{}' of service '{}' already registered",
                    route,
                    service
                );
            }
            None => {}
        }
        guard.insert(key, Slot { reg, handler });
        guard.publish();
        Ok(())
    }

    fn remove_route(&self, service: &ServiceId, route: &str, reg: RegId) -> bool {
        let mut writer = lock(&self.routes_w);
        let mut guard = writer.guard();
        let key = route_key(service, route);
        let owned = guard.get(&key).map_or(false, |slot| slot.reg == reg);
        if owned {
            guard.remove(key);
        }
        guard.publish();
        owned
    }
}

/// The local RPC service registry. Cheap to clone; all clones share the
/// same tables.
#[derive(Clone)]
pub struct RpcRegistry {
    core: Arc<RegistryCore>,
}

impl RpcRegistry {
    /// Creates an empty registry.
    pub fn new(me: impl Into<String>) -> Self {
        let (globals_w, globals_r) = flashmap::new::<String, Slot>();
        let (routes_w, routes_r) = flashmap::new::<String, Slot>();
        RpcRegistry {
            core: Arc::new(RegistryCore {
                me: me.into(),
                globals_w: Mutex::new(globals_w),
                globals_r: Mutex::new(globals_r),
                routes_w: Mutex::new(routes_w),
                routes_r: Mutex::new(routes_r),
                next_reg: AtomicU64::new(0),
            }),
        }
    }

    /// Registers the global implementation of `service`. Fails if another
    /// registration of the same service is still open.
    pub fn register(
        &self,
        service: ServiceId,
        handler: HandlerRef,
    ) -> Result<Registration, ClusterBenchError> {
        let reg = self.core.new_reg_id();
        self.core.insert_global(&service, reg, handler)?;
        pf_debug!(self.core.me; "registered global '{}'", service);
        Ok(Registration {
            core: self.core.clone(),
            service,
            reg,
            closed: AtomicBool::new(false),
        })
    }

    /// Registers a routed implementation of `service` with no routes bound
    /// yet. Routes are added through `RoutedRegistration::register_path()`.
    pub fn register_routed(
        &self,
        service: ServiceId,
        handler: HandlerRef,
    ) -> RoutedRegistration {
        RoutedRegistration {
            core: self.core.clone(),
            service,
            reg: self.core.new_reg_id(),
            handler,
            paths: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Registers a routed implementation of `service` bound to `route`.
    pub fn register_routed_at(
        &self,
        service: ServiceId,
        route: impl Into<RouteId>,
        handler: HandlerRef,
    ) -> Result<RoutedRegistration, ClusterBenchError> {
        let routed = self.register_routed(service, handler);
        routed.register_path(route)?;
        Ok(routed)
    }

    /// Looks up the global implementation of `service`.
    pub fn lookup(&self, service: &ServiceId) -> Option<HandlerRef> {
        let reader = lock(&self.core.globals_r);
        lookup_in(&reader, &service.to_string())
    }

    /// Looks up the implementation of `service` bound to `route`. Never falls
    /// back to the global implementation.
    pub fn lookup_routed(
        &self,
        service: &ServiceId,
        route: &str,
    ) -> Option<HandlerRef> {
        let reader = lock(&self.core.routes_r);
        lookup_in(&reader, &route_key(service, route))
    }

    /// Creates a call dispatcher owning its own read handles.
    pub fn invoker(&self) -> RpcInvoker {
        RpcInvoker {
            globals: lock(&self.core.globals_r).clone(),
            routes: lock(&self.core.routes_r).clone(),
        }
    }
}

/// Handle of a global registration. Closing is idempotent and also happens
/// on drop.
pub struct Registration {
    core: Arc<RegistryCore>,
    service: ServiceId,
    reg: RegId,
    closed: AtomicBool,
}

impl Registration {
    /// Service this registration is for.
    pub fn service(&self) -> &ServiceId {
        &self.service
    }

    /// Returns true if the registration has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Removes the handler from the registry. Calling it again is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.core.remove_global(&self.service, self.reg) {
            pf_debug!(self.core.me; "unregistered global '{}'", self.service);
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handle of a routed registration, owning the set of routes bound to its
/// handler. Closing unbinds every route; it is idempotent and also happens
/// on drop.
pub struct RoutedRegistration {
    core: Arc<RegistryCore>,
    service: ServiceId,
    reg: RegId,
    handler: HandlerRef,
    paths: Mutex<HashSet<RouteId>>,
    closed: AtomicBool,
}

impl RoutedRegistration {
    /// Service this registration is for.
    pub fn service(&self) -> &ServiceId {
        &self.service
    }

    /// Binds the handler to `route`. Fails if the registration is closed or
    /// the route is bound to another handler.
    pub fn register_path(
        &self,
        route: impl Into<RouteId>,
    ) -> Result<(), ClusterBenchError> {
        let route = route.into();
        let mut paths = lock(&self.paths);
        if self.closed.load(Ordering::Acquire) {
            return logged_err!(
                self.core.me;
                "register_path '{}' on closed registration of '{}'",
                route,
                self.service
            );
        }
        self.core.insert_route(
            &self.service,
            &route,
            self.reg,
            self.handler.clone(),
        )?;
        pf_debug!(self.core.me; "registered route '{}' of '{}'", route, self.service);
        paths.insert(route);
        Ok(())
    }

    /// Unbinds `route`. Returns false if it was not bound by this
    /// registration.
    pub fn unregister_path(&self, route: &str) -> bool {
        let mut paths = lock(&self.paths);
        if !paths.remove(route) {
            return false;
        }
        self.core.remove_route(&self.service, route, self.reg)
    }

    /// Routes currently bound by this registration.
    pub fn paths(&self) -> Vec<RouteId> {
        lock(&self.paths).iter().cloned().collect()
    }

    /// Returns true if the registration has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Unbinds all routes. Calling it again is a no-op.
    pub fn close(&self) {
        let mut paths = lock(&self.paths);
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for route in paths.drain() {
            self.core.remove_route(&self.service, &route, self.reg);
        }
        pf_debug!(self.core.me; "closed routed registration of '{}'", self.service);
    }
}

impl Drop for RoutedRegistration {
    fn drop(&mut self) {
        self.close();
    }
}

/// Call dispatcher over the registry tables. Each invoker owns private read
/// handles, so give every concurrent caller its own (clone it or call
/// `RpcRegistry::invoker()` again).
#[derive(Clone)]
pub struct RpcInvoker {
    globals: TableReader,
    routes: TableReader,
}

impl RpcInvoker {
    /// Looks up the global implementation of `service`.
    pub fn lookup(&self, service: &ServiceId) -> Option<HandlerRef> {
        lookup_in(&self.globals, &service.to_string())
    }

    /// Looks up the implementation of `service` bound to `route`.
    pub fn lookup_routed(
        &self,
        service: &ServiceId,
        route: &str,
    ) -> Option<HandlerRef> {
        lookup_in(&self.routes, &route_key(service, route))
    }

    /// Dispatches a call: to the routed implementation if the request carries
    /// a route, to the global one otherwise. The handler is resolved now; the
    /// returned future only runs the call.
    pub fn invoke(
        &self,
        service: &ServiceId,
        req: RpcRequest,
    ) -> BoxFuture<'static, Result<RpcOutput, ClusterBenchError>> {
        let handler = match req.route {
            Some(ref route) => self.lookup_routed(service, route),
            None => self.lookup(service),
        };

        match handler {
            Some(handler) => async move { handler.handle(req).await }.boxed(),
            None => {
                let e = match req.route {
                    Some(route) => ClusterBenchError(format!(
                        "no handler for '{}' at route '{}'",
                        service, route
                    )),
                    None => ClusterBenchError(format!(
                        "no handler for '{}'",
                        service
                    )),
                };
                future::ready(Err(e)).boxed()
            }
        }
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;
    use crate::rpc::{make_payload, RpcInput};

    /// Echoes payloads and tags replies with its own name.
    struct TagHandler(u32);

    #[async_trait]
    impl RpcHandler for TagHandler {
        async fn handle(
            &self,
            req: RpcRequest,
        ) -> Result<RpcOutput, ClusterBenchError> {
            match req.input {
                RpcInput::Payload { mut items } => {
                    items.push(crate::rpc::PayloadItem { id: self.0 });
                    Ok(RpcOutput::Payload { items })
                }
                _ => Err(ClusterBenchError::msg("unexpected input")),
            }
        }
    }

    fn tag_of(output: RpcOutput) -> Option<u32> {
        match output {
            RpcOutput::Payload { items } => items.last().map(|item| item.id),
            _ => None,
        }
    }

    fn probe() -> RpcInput {
        RpcInput::Payload { items: vec![] }
    }

    #[test]
    fn register_lookup_close() -> Result<(), ClusterBenchError> {
        let registry = RpcRegistry::new("t");
        let svc = ServiceId::new("svc");
        assert!(registry.lookup(&svc).is_none());
        let reg = registry.register(svc.clone(), Arc::new(TagHandler(1)))?;
        assert_eq!(reg.service(), &svc);
        assert!(registry.lookup(&svc).is_some());
        reg.close();
        assert!(reg.is_closed());
        assert!(registry.lookup(&svc).is_none());
        reg.close(); // second close is a no-op
        assert!(registry.lookup(&svc).is_none());
        Ok(())
    }

    #[test]
    fn register_twice_rejected() -> Result<(), ClusterBenchError> {
        let registry = RpcRegistry::new("t");
        let svc = ServiceId::new("svc");
        let reg = registry.register(svc.clone(), Arc::new(TagHandler(1)))?;
        assert!(registry
            .register(svc.clone(), Arc::new(TagHandler(2)))
            .is_err());
        reg.close();
        let _reg2 = registry.register(svc.clone(), Arc::new(TagHandler(2)))?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_close_keeps_new_owner() -> Result<(), ClusterBenchError> {
        let registry = RpcRegistry::new("t");
        let svc = ServiceId::new("svc");
        let reg1 = registry.register(svc.clone(), Arc::new(TagHandler(1)))?;
        reg1.close();
        let _reg2 = registry.register(svc.clone(), Arc::new(TagHandler(2)))?;
        reg1.close();
        drop(reg1);
        let out = registry
            .invoker()
            .invoke(&svc, RpcRequest::global(probe()))
            .await?;
        assert_eq!(tag_of(out), Some(2));
        Ok(())
    }

    #[test]
    fn drop_closes_registration() -> Result<(), ClusterBenchError> {
        let registry = RpcRegistry::new("t");
        let svc = ServiceId::new("svc");
        {
            let _reg =
                registry.register(svc.clone(), Arc::new(TagHandler(1)))?;
            assert!(registry.lookup(&svc).is_some());
        }
        assert!(registry.lookup(&svc).is_none());
        let routed = registry.register_routed_at(
            svc.clone(),
            "a",
            Arc::new(TagHandler(1)),
        )?;
        assert_eq!(routed.service(), &svc);
        assert!(registry.lookup_routed(&svc, "a").is_some());
        drop(routed);
        assert!(registry.lookup_routed(&svc, "a").is_none());
        Ok(())
    }

    #[test]
    fn close_from_many_threads() -> Result<(), ClusterBenchError> {
        let registry = RpcRegistry::new("t");
        let svc = ServiceId::new("svc");
        let reg =
            Arc::new(registry.register(svc.clone(), Arc::new(TagHandler(1)))?);
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let reg = reg.clone();
                std::thread::spawn(move || reg.close())
            })
            .collect();
        for t in threads {
            t.join().map_err(|_| ClusterBenchError::msg("thread panicked"))?;
        }
        assert!(registry.lookup(&svc).is_none());
        Ok(())
    }

    #[test]
    fn routed_isolation() -> Result<(), ClusterBenchError> {
        let registry = RpcRegistry::new("t");
        let svc = ServiceId::new("svc");
        let ra =
            registry.register_routed_at(svc.clone(), "a", Arc::new(TagHandler(1)))?;
        assert!(registry.lookup_routed(&svc, "a").is_some());
        assert!(registry.lookup_routed(&svc, "b").is_none());
        let rb =
            registry.register_routed_at(svc.clone(), "b", Arc::new(TagHandler(2)))?;
        assert!(ra.unregister_path("a"));
        assert!(!ra.unregister_path("a"));
        assert!(registry.lookup_routed(&svc, "a").is_none());
        assert!(registry.lookup_routed(&svc, "b").is_some());
        assert_eq!(rb.paths(), vec![String::from("b")]);
        // routed handlers never answer for the global identity
        assert!(registry.lookup(&svc).is_none());
        Ok(())
    }

    #[test]
    fn route_has_single_owner() -> Result<(), ClusterBenchError> {
        let registry = RpcRegistry::new("t");
        let svc = ServiceId::new("svc");
        let ra = registry.register_routed(svc.clone(), Arc::new(TagHandler(1)));
        let rb = registry.register_routed(svc.clone(), Arc::new(TagHandler(2)));
        ra.register_path("x")?;
        ra.register_path("x")?; // re-binding own route is fine
        assert!(rb.register_path("x").is_err());
        ra.close();
        rb.register_path("x")?;
        assert!(ra.register_path("y").is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invoke_dispatch() -> Result<(), ClusterBenchError> {
        let registry = RpcRegistry::new("t");
        let svc = ServiceId::new("svc");
        let invoker = registry.invoker();
        // nothing registered yet
        assert!(invoker
            .invoke(&svc, RpcRequest::global(probe()))
            .await
            .is_err());
        let _g = registry.register(svc.clone(), Arc::new(TagHandler(10)))?;
        let _r =
            registry.register_routed_at(svc.clone(), "a", Arc::new(TagHandler(20)))?;
        let out = invoker
            .invoke(
                &svc,
                RpcRequest::global(RpcInput::Payload {
                    items: make_payload(3),
                }),
            )
            .await?;
        assert_eq!(tag_of(out), Some(10));
        let out = invoker.invoke(&svc, RpcRequest::routed("a", probe())).await?;
        assert_eq!(tag_of(out), Some(20));
        // no fallback from a missing route to the global handler
        assert!(invoker
            .invoke(&svc, RpcRequest::routed("b", probe()))
            .await
            .is_err());
        // handler-declared failures come back as errors
        assert!(invoker
            .invoke(&svc, RpcRequest::global(RpcInput::Discover))
            .await
            .is_err());
        Ok(())
    }
}

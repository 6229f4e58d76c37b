//! Kernel registry and the dispatch entry point.
//!
//! The registry is an explicit object with a two-phase life: mutable while
//! the host registers kernels during startup, then consumed by
//! [`DispatchContext::new`] and frozen. Sealing by move means lookups after
//! initialization touch an immutable map and need no synchronization at all.
//!
//! `dispatch` is the single crossing point of the ABI. It never unwinds and
//! never returns a value: every outcome, including a panicking kernel or a
//! kernel that forgets to report, ends up in the caller's [`StatusSlot`].

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::{Deserialize, Serialize};

use crate::error::{DespacharError, Result};
use crate::pool::{DeviceKey, HandlePool, PoolConfig, PoolStats};
use crate::status::{StatusCode, StatusSlot};

/// Native entry-point signature every kernel conforms to.
///
/// Arguments: dispatch context (pool access), device key, encoded descriptor,
/// input buffers, output buffers, status slot. Kernels write results in place
/// into the output buffers and report exclusively through the slot.
pub type KernelFn = fn(
    ctx: &DispatchContext,
    device: DeviceKey,
    descriptor: &[u8],
    inputs: &[&[u8]],
    outputs: &mut [&mut [u8]],
    status: &mut StatusSlot,
);

/// A registered kernel: stable name plus its entry point
#[derive(Clone)]
pub struct KernelEntry {
    name: String,
    func: KernelFn,
}

impl KernelEntry {
    /// The name this kernel is dispatched under
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for KernelEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelEntry")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Introspection record for a registered kernel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfo {
    /// Registered dispatch name
    pub name: String,
}

/// Append-only mapping from kernel name to entry point.
///
/// Mutable only through `&mut self` during the startup phase; constructing a
/// [`DispatchContext`] consumes the registry, after which no further
/// registration is possible.
#[derive(Debug, Default)]
pub struct KernelRegistry {
    entries: HashMap<String, KernelEntry>,
}

impl KernelRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kernel under a stable name.
    ///
    /// # Errors
    ///
    /// Returns [`DespacharError::DuplicateKernel`] if the name is taken.
    /// Duplicate builtin names are a startup-fatal condition for the host.
    pub fn register(&mut self, name: impl Into<String>, func: KernelFn) -> Result<()> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(DespacharError::DuplicateKernel { name });
        }
        self.entries
            .insert(name.clone(), KernelEntry { name, func });
        Ok(())
    }

    /// Look up a kernel by name
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&KernelEntry> {
        self.entries.get(name)
    }

    /// Number of registered kernels
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorted listing of registered kernels
    #[must_use]
    pub fn kernels(&self) -> Vec<KernelInfo> {
        let mut infos: Vec<KernelInfo> = self
            .entries
            .keys()
            .map(|name| KernelInfo { name: name.clone() })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}

/// Sealed registry plus the handle pool: everything a dispatch needs.
///
/// Constructed once during startup and passed by reference to anything that
/// dispatches; there is no ambient global state.
pub struct DispatchContext {
    registry: KernelRegistry,
    pool: HandlePool,
}

impl DispatchContext {
    /// Seal a populated registry and attach a handle pool
    #[must_use]
    pub fn new(registry: KernelRegistry, config: PoolConfig) -> Self {
        Self {
            registry,
            pool: HandlePool::new(config),
        }
    }

    /// Context with the builtin kernel set registered.
    ///
    /// # Errors
    ///
    /// Propagates a duplicate-name registration error, which for the builtin
    /// set indicates a build defect.
    pub fn with_builtins(config: PoolConfig) -> Result<Self> {
        let mut registry = KernelRegistry::new();
        crate::kernels::register_builtin_kernels(&mut registry)?;
        Ok(Self::new(registry, config))
    }

    /// The handle pool kernels draw from
    #[must_use]
    pub fn pool(&self) -> &HandlePool {
        &self.pool
    }

    /// Sorted listing of dispatchable kernels
    #[must_use]
    pub fn kernels(&self) -> Vec<KernelInfo> {
        self.registry.kernels()
    }

    /// Accounting snapshot for one device pool
    ///
    /// # Errors
    ///
    /// Returns an error if the pool bookkeeping mutex is poisoned.
    pub fn pool_stats(&self, key: DeviceKey) -> Result<Option<PoolStats>> {
        self.pool.stats(key)
    }

    /// Look up `name` and run its kernel over the supplied buffers.
    ///
    /// All outcomes are reported through `status`:
    /// - unknown name → [`StatusCode::Unimplemented`], no buffer is touched;
    /// - kernel panic → intercepted here, [`StatusCode::Internal`];
    /// - kernel returning without writing → [`StatusCode::Internal`].
    ///
    /// On any non-ok status the output buffers may hold partial writes and
    /// must be discarded by the caller.
    pub fn dispatch(
        &self,
        name: &str,
        device: DeviceKey,
        descriptor: &[u8],
        inputs: &[&[u8]],
        outputs: &mut [&mut [u8]],
        status: &mut StatusSlot,
    ) {
        let Some(entry) = self.registry.lookup(name) else {
            log::warn!("dispatch of unregistered kernel `{name}`");
            let err = DespacharError::UnknownKernel {
                name: name.to_string(),
            };
            status.write_error(err.status_code(), err.to_string());
            return;
        };

        // Failure boundary: nothing unwinds past this frame. The handle
        // guard inside the kernel releases during the unwind, so an
        // intercepted panic cannot leak a borrowed handle.
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            (entry.func)(self, device, descriptor, inputs, &mut *outputs, &mut *status);
        }));

        if let Err(payload) = outcome {
            let detail = panic_message(payload.as_ref());
            log::error!("kernel `{name}` panicked: {detail}");
            status.write_error(
                StatusCode::Internal,
                format!("kernel `{name}` panicked: {detail}"),
            );
        }

        if !status.is_written() {
            log::error!("kernel `{name}` returned without writing status");
            status.write_error(
                StatusCode::Internal,
                format!("kernel `{name}` returned without writing status"),
            );
        }
    }
}

impl std::fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchContext")
            .field("kernels", &self.registry.len())
            .field("pool", &self.pool)
            .finish()
    }
}

/// Best-effort extraction of a panic payload's message
fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

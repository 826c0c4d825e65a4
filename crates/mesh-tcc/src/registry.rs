//! Compensable service registry
//!
//! Services are registered explicitly at startup. Each registration records
//! the service's descriptor plus an invocation record and installs the
//! Confirm/Cancel handlers the descriptor advertises. After startup the
//! registry is only read.

use std::any::type_name;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::descriptor::CompensableDescriptor;
use crate::error::{Result, TxnError};
use crate::invoker::{Compensable, Factory, Phase, PhaseHandler, TypedPhase};

/// Invocation record built once at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnInvocation {
    pub descriptor: CompensableDescriptor,
    pub target_type: &'static str,
    /// Argument list type; a tuple lists the parameters in order.
    pub param_type: &'static str,
}

/// Registry of compensable services
#[derive(Default)]
pub struct CompensableRegistry {
    invocations: RwLock<HashMap<String, Arc<TxnInvocation>>>,
    handlers: RwLock<HashMap<(String, Phase), Arc<dyn PhaseHandler>>>,
}

impl CompensableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service. `factory` builds the fresh instances used for
    /// Confirm and Cancel.
    pub fn register<S, F>(&self, descriptor: CompensableDescriptor, factory: F) -> Result<Arc<TxnInvocation>>
    where
        S: Compensable,
        F: Fn() -> S + Send + Sync + 'static,
    {
        let name = descriptor.service_name.clone();
        if name.is_empty() {
            return Err(TxnError::structural("service name must not be empty"));
        }

        let mut invocations = self
            .invocations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if invocations.contains_key(&name) {
            return Err(TxnError::AlreadyRegistered(name));
        }

        let factory: Factory<S> = Arc::new(factory);
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if descriptor.flags.has_confirm() {
            handlers.insert(
                (name.clone(), Phase::Confirm),
                Arc::new(TypedPhase::new(factory.clone(), Phase::Confirm)),
            );
        }
        if descriptor.flags.has_cancel() {
            handlers.insert(
                (name.clone(), Phase::Cancel),
                Arc::new(TypedPhase::new(factory, Phase::Cancel)),
            );
        }

        let invocation = Arc::new(TxnInvocation {
            descriptor,
            target_type: type_name::<S>(),
            param_type: type_name::<S::Params>(),
        });
        invocations.insert(name.clone(), invocation.clone());

        tracing::info!(
            service = %name,
            confirm = invocation.descriptor.flags.has_confirm(),
            cancel = invocation.descriptor.flags.has_cancel(),
            propagator = invocation.descriptor.is_propagator,
            "Registered compensable service"
        );
        Ok(invocation)
    }

    pub fn invocation(&self, service_name: &str) -> Option<Arc<TxnInvocation>> {
        self.invocations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(service_name)
            .cloned()
    }

    pub fn descriptor(&self, service_name: &str) -> Result<CompensableDescriptor> {
        self.invocation(service_name)
            .map(|invocation| invocation.descriptor.clone())
            .ok_or_else(|| TxnError::NotRegistered {
                service: service_name.to_string(),
                phase: Phase::Try,
            })
    }

    pub fn handler(&self, service_name: &str, phase: Phase) -> Result<Arc<dyn PhaseHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(service_name.to_string(), phase))
            .cloned()
            .ok_or_else(|| TxnError::NotRegistered {
                service: service_name.to_string(),
                phase,
            })
    }

    /// Registered service names, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .invocations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

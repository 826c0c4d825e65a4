//! Try-Confirm-Cancel transactions for mesh services.
//!
//! A chain of independently deployed services takes part in one
//! all-or-nothing business transaction. The first participating service
//! begins a global transaction with the coordinator, downstream services
//! join it as branches, and once the root's Try has run the coordinator
//! calls every branch back to Confirm or Cancel.
//!
//! # Components
//!
//! - [`TransactionProxy`]: wraps a business call, decides root, branch or
//!   propagator, and drives the protocol around Try.
//! - [`TransactionManager`]: Begin / Join / End against the coordinator over
//!   an [`RpcClient`].
//! - [`CompensableRegistry`] and [`MethodInvoker`]: registered services and
//!   the dispatch of their Try, Confirm and Cancel methods.
//! - [`callback::router`]: the HTTP endpoint the coordinator calls back.
//!
//! # Usage
//!
//! ```ignore
//! let registry = Arc::new(CompensableRegistry::new());
//! registry.register(
//!     CompensableDescriptor::new("reserve-stock", "TryReserve")
//!         .with_confirm("ConfirmReserve")
//!         .with_cancel("CancelReserve"),
//!     StockService::default,
//! )?;
//!
//! let manager = Arc::new(TransactionManager::new(TxnConfig::from_env()));
//! let proxy = TransactionProxy::new(registry, manager);
//!
//! let reserved = proxy
//!     .execute(&mut ctx, "reserve-stock", &stock, ("sku-1".to_string(), 2))
//!     .await?;
//! ```

pub mod address;
pub mod callback;
pub mod config;
pub mod descriptor;
pub mod envelope;
pub mod error;
pub mod invoker;
pub mod manager;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod rpc;

pub use address::{CoordinatorAddress, Operation, ParticipantAddress};
pub use callback::CallbackState;
pub use config::{CommMode, ConfigError, ConfigHandle, TxnConfig};
pub use descriptor::{CompensableDescriptor, CompensableFlags};
pub use error::{codes, Result, ServiceError, TxnError};
pub use invoker::{CallerMetadata, Compensable, MethodInvoker, ParamBlob, Phase};
pub use manager::{Participant, TransactionManager};
pub use proxy::{Role, TransactionProxy};
pub use registry::{CompensableRegistry, TxnInvocation};
pub use rpc::{HttpRpcClient, HttpRpcConfig, RpcClient, RpcError, RpcRequest, RpcResponse};

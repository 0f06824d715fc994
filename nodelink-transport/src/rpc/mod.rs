//! Service calls between nodes.
//!
//! # Caller side
//!
//! ```text
//! proxy method ─► RemoteServiceCaller ─► ServiceCallInvoker
//!                        │ (reliable)          │ local target: dispatcher
//!                        ▼                     │ remote target: MessageRouter
//!              ReliableRpcStreamHandle ────────┘
//! ```
//!
//! # Callee side
//!
//! A `ServiceCall` request reaches the [`ServiceCallDispatcher`], which
//! resolves the service in the [`LocalServiceRegistry`], checks the method
//! whitelist and invokes the [`ServiceDispatch`] table.
//!
//! Business exceptions travel back inside [`ServiceCallResult`]; everything
//! else is a [`RemoteOperationError`] with a distinct [`RemoteErrorKind`].

mod call;
#[doc(hidden)]
pub mod codegen;
mod dispatcher;
mod invoker;
mod proxy;
mod registry;
mod reliable;

pub use call::{
    CallError, ReliableCallTag, RemoteErrorKind, RemoteOperationError, ServiceCallEnvelope,
    ServiceCallRequest, ServiceCallResult, ServiceException,
};
pub use dispatcher::ServiceCallDispatcher;
pub use proxy::{RemoteServiceCaller, ServiceCallInvoker, ServiceProxy, ServiceProxyFactory};
pub use registry::{
    InvocationError, LocalServiceLookupResult, LocalServiceRegistry, ServiceDispatch,
};
pub use reliable::{DEFAULT_STREAM_IDLE_TIMEOUT, ReliableRpcStreamHandle, ReliableStreamPolicy};

pub(crate) use dispatcher::ServiceCallRequestHandler;
pub(crate) use invoker::NodeServiceCallInvoker;

//! # Berth Core
//!
//! Framework-agnostic core of the Berth agent: operation orchestration for
//! Docker Compose stacks, streamed command execution, stack archives, and
//! container engine event monitoring.
//!
//! The HTTP/websocket surface lives in the `berth-agent` binary crate;
//! everything here receives its collaborators by constructor injection and
//! can be driven from tests without a server.

pub mod archive;
pub mod broadcast;
pub mod events;
pub mod registry;
pub mod runner;
pub mod selfupdate;
pub mod stack;
pub mod validate;
pub mod vault;

pub use archive::{ArchiveError, ArchiveFormat, CreateOptions, ExtractOptions};
pub use broadcast::{Broadcaster, MessageSink, OperationMessage};
pub use events::{
    EventMonitor, OperationProgressEvent, StackAggregate, StackContainerEvent, StatusEvent,
    StatusSink,
};
pub use registry::{
    OperationRegistry, OperationStatus, OperationView, RegistryConfig, RegistryError,
};
pub use runner::{CommandRunner, RunnerError};
pub use selfupdate::{SelfUpdateConfig, SelfUpdateCoordinator};
pub use stack::StackPathError;
pub use validate::{OperationRequest, OperationVerb, ValidationError};
pub use vault::{CredentialVault, RegistryCredential, VaultError};

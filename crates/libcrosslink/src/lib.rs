pub mod callbacks;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod external;
pub mod relation;
pub mod resolve;
pub mod service;
pub mod session;

mod engine;

pub use callbacks::{CallbackEntry, CallbackRegistry, ContinuationCallback};
pub use config::CrosslinkConfig;
pub use dispatcher::{Dispatcher, DispatcherHandle};
pub use error::CrosslinkError;
pub use external::{
    AbilityEntry, BundleMetadata, BundleRef, ComponentHandle, ComponentLifecycle,
    ContinueTypeEntry, DeviceDirectory, DeviceInfo, MetadataCache, StartDescriptor, Transport,
};
pub use relation::{PartyClaim, RelationChecker};
pub use resolve::{PeerResolver, ResolvedPair};
pub use service::{CollaborationRequest, ContinuationRequest, Crosslink};
pub use session::{ChannelId, SessionRole, SessionSnapshot, SessionState};

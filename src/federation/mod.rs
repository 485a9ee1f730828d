//! ActivityPub federation module
//!
//! Handles:
//! - Inbox POST processing (parse, gates, bookkeeping)
//! - Activity dispatch to wrapped defaults and application handlers
//! - Inbox forwarding
//! - Delivery target resolution and outbound delivery
//! - HTTP Signatures

mod delivery;
mod dispatch;
mod engine;
mod forwarding;
mod gate;
mod protocol;
mod request;
mod signature;
mod store;
mod transport;
mod wrapped;

pub use delivery::{Deliverer, DeliveryResolver, DeliveryTargets, TraversalSettings};
pub use dispatch::{
    ActivityHandler, DispatchTable, Dispatcher, OtherHandler, Route, WrappedCallbacks, handler_fn,
};
pub use engine::{FederationEngine, Ports};
pub use forwarding::{ForwardingOutcome, InboxForwarder, SkipReason};
pub use gate::{AuthOutcome, authenticate, authorize};
pub use protocol::{
    Authenticator, Blocklist, CallbackProvider, ForwardingFilter, InboxReader, InboxResolution,
    InboxResolver, PassthroughResolver, RecursionLimits, RequestBodyHook, ResolvedInboxes,
};
pub use request::{InboxRequest, ResponseSink, WrittenResponse};
pub use signature::{
    SignatureHeaders, advertised_key, extract_signature_key_id, generate_digest,
    key_id_matches_actor, parse_signature_header, sign_request, verify_signature,
};
pub use store::{CollectionKind, MemoryStore, Store};
pub use transport::{DeliveryResult, HttpTransport, SigningCredentials, Transport};
pub use wrapped::WrappedDefaults;

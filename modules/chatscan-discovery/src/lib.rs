pub mod completion;
pub mod identity;
pub mod normalizer;
pub mod orchestrator;
pub mod page;
pub mod publisher;
pub mod selector;
pub mod session;
pub mod sources;
pub mod stats;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod working_set;

pub use orchestrator::{last_result, Orchestrator};
pub use page::{ChatPage, NetworkResponse, NetworkScope, PageElement};
pub use publisher::STREAMING_KEY;
pub use session::{SessionLease, SessionRegistry};
pub use sources::{EntitySource, PageSourceFactory, SourceFactory};

//! Test support for maestro: an in-memory job store with real
//! compare-and-transition semantics, plus the media-platform work-type
//! enum used by the test suites.

mod store;
mod work;

pub use store::InMemoryJobStore;
pub use work::TestWorkType;

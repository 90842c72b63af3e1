pub mod lock;
pub mod store;

pub use lock::JobLocks;
pub use store::{ContactPatch, ContactStore};

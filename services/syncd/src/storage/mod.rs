pub mod store;

pub use store::{Page, StoreError, SyncStore};

pub mod config;
pub mod error;
pub mod store;
pub mod types;

pub use config::AppConfig;
pub use error::{AudienceError, AudienceResult};
pub use store::{AuditStore, Clock, SegmentStore, StoreError, Stores, TaskStore, UserStore};

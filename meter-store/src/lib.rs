pub mod db;
pub mod domain;
pub mod error;

pub use db::LocalStore;
pub use error::{StoreError, StoreResult};

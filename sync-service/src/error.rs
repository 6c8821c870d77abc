use meter_store::StoreError;

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("a sync run is already in progress")]
    AlreadyRunning,
    #[error("local store error: {0}")]
    Store(#[from] StoreError),
    #[error("configuration error: {0}")]
    Config(String),
}

// Store module: blob persistence for proxies and probe schedules

pub mod backend;

pub use backend::{
    get_record, put_record, scan_records, MemoryStorage, SledStorage, StorageBackend, StoreError,
};

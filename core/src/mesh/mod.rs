// Mesh bases and the objects they replicate

pub mod meshbase;
pub mod object;
pub mod synchronizer;
pub mod transaction;

pub use meshbase::{MeshBase, MeshBaseError, MeshBaseOptions, ShadowControl};
pub use object::{now_millis, Change, MeshObject, Properties, PropertyValue, ReplicaInfo, ReplicaPayload};
pub use synchronizer::{AccessError, Completion, PendingKey, Synchronizer};
pub use transaction::{
    apply_changes, validate_local, CommittedTransaction, ReplicaMap, Transaction, TransactionError,
};

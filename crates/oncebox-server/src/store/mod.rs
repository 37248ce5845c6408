pub mod backend;
pub mod codec;
pub mod crypto;
pub mod gate;
pub mod model;
pub mod sweep;
pub mod vault;

pub use backend::{open_backend, Backend, BackendKind, FsBackend, MemoryBackend, RedbBackend};
pub use crypto::{CipherMode, CipherProvider, EncryptionKey};
pub use gate::{AccessGate, GateParams};
pub use model::{Payload, PayloadKind, Revealed, Seal, SecretRecord, SecretStatus};
pub use vault::{Clock, ManualClock, NewSecret, Receipt, SystemClock, Vault};

//! Impls - ports の実装（開発用・テスト用）
//!
//! - **MemoryStore**: プロセス内の共有ストア（TTL, CAS, list, pub/sub）
//!
//! 本番用のストア実装は別クレートに置く想定です。

pub mod memory_store;

pub use self::memory_store::{MemoryBackend, MemoryConnector, MemoryStore};

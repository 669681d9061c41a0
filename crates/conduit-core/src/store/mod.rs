//! Store - 共有ストアへのアクセス層
//!
//! - `pool`: 接続の共有と idle teardown
//! - `keys`: 安定したキー配置
//! - `record`: JSON レコードの条件付き read-modify-write

pub mod keys;
pub mod pool;
pub(crate) mod record;

pub use self::pool::{StoreConn, StorePool};

//! Ports - 抽象化レイヤー
//!
//! 外部システム（共有ストア、時計、ID 生成）へのインターフェース。
//! 実装は `impls` に置きます。

pub mod clock;
pub mod id_generator;
pub mod store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::store::{SharedStore, StoreConnector, StoreError, Subscription};

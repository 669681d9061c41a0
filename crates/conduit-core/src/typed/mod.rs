//! Typed - 型付き Job API
//!
//! このモジュールは queue 名の typo を型で排除し、
//! Handler との対応付けを静的に保証します。
//!
//! # 二層構造
//! - **表層（Typed）**: `JobKind` trait, `Handler<T>` trait - 型安全
//! - **内部（Dyn）**: `DynHandler` trait - object-safe, type erasure

pub mod handler;
pub mod job;
pub mod registry;

// 主要な trait/型 を再エクスポート
pub use self::handler::{DynHandler, Handler, JobContext, TypedHandler};
pub use self::job::JobKind;
pub use self::registry::{HandlerRegistry, Registration, RegistryError};

//! App - アプリケーション層
//!
//! queue / status machine / recorder を組み合わせて動かす。
//!
//! # 主要コンポーネント
//! - **PipelineBuilder**: 構築とワイヤリング（起動時検証つき）
//! - **Pipeline**: 呼び出し側が使う表面
//! - **WorkerPool**: queue ごとの worker slot（claim→handle→report）
//! - **ReaperLoop**: idle 接続の解放と orphan status の修復

pub mod builder;
pub mod pipeline;
pub mod reaper_loop;
pub mod worker_pool;

pub use self::builder::{BuildError, PipelineBuilder};
pub use self::pipeline::{Pipeline, Running};
pub use self::reaper_loop::{ReaperLoop, ReaperTick};
pub use self::worker_pool::WorkerPool;

//! conduit-core
//!
//! Background job pipeline: a deduplicating job queue, worker slots that run
//! typed handlers, a per-entity indexing-status state machine and an
//! append-only event recorder for agent tasks.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, payload, job, entity, task, outcome, errors）
//! - **ports**: 抽象化レイヤー（SharedStore, Clock, IdGenerator）
//! - **impls**: 実装（プロセス内メモリストア）
//! - **store**: 接続プール・キー設計・CAS ヘルパー
//! - **queue**: JobQueue, JobLease, RetryPolicy
//! - **status**: EntityStatusMachine
//! - **recorder**: TaskRecorder
//! - **typed**: 型付き Job API（JobKind, Handler, HandlerRegistry）
//! - **app**: PipelineBuilder, Pipeline, WorkerPool, ReaperLoop

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod recorder;
pub mod status;
pub mod store;
pub mod typed;

#[cfg(test)]
mod test_support;

pub use app::{Pipeline, PipelineBuilder};
pub use config::PipelineConfig;

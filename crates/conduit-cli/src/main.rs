use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::time::{Duration, sleep};
use tracing::info;
use tracing_subscriber::EnvFilter;

use conduit_core::domain::{
    EntityId, HandlerError, HandlerResult, IndexConversation, IndexingStatus, JobOutput,
    SummarizeConversation, TaskEventType,
};
use conduit_core::typed::{Handler, JobContext, JobKind};
use conduit_core::{PipelineBuilder, PipelineConfig};

/// Fails the first `failures` calls, then indexes successfully.
struct FlakyIndexer {
    remaining_failures: AtomicU32,
}

impl FlakyIndexer {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl Handler<IndexConversation> for FlakyIndexer {
    async fn handle(&self, job: IndexConversation, ctx: JobContext) -> HandlerResult {
        ctx.checkpoint()?;

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::transient(format!(
                "embedding service unavailable (left={left})"
            )));
        }

        sleep(Duration::from_millis(20)).await;
        ctx.checkpoint()?;
        info!(conversation_id = %job.conversation_id, attempt = ctx.attempt, "conversation indexed");
        Ok(JobOutput::with_summary(serde_json::json!({ "chunks": 12 })))
    }
}

struct Summarizer;

#[async_trait]
impl Handler<SummarizeConversation> for Summarizer {
    async fn handle(&self, job: SummarizeConversation, _ctx: JobContext) -> HandlerResult {
        info!(conversation_id = %job.conversation_id, force = job.force, "conversation summarized");
        Ok(JobOutput::empty())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // (A) 設定と handler を登録して組み立てる（ストアはプロセス内メモリ）
    let mut config = PipelineConfig::from_env()?;
    config.default_backoff.base_delay = Duration::from_millis(100);
    let pipeline = PipelineBuilder::new()
        .config(config)
        .register::<IndexConversation, _>(FlakyIndexer::new(2))?
        .register::<SummarizeConversation, _>(Summarizer)?
        .expect_queues(&[IndexConversation::QUEUE, SummarizeConversation::QUEUE])
        .build()?;

    // (B) worker と reaper を起動
    let running = pipeline.start().await?;

    // (C) indexing を依頼（2 回目は Conflict になる）
    let conv = EntityId::new("conv-1");
    let first = pipeline.retry_indexing(&conv).await?;
    println!("retry: {:?}", first.status());
    let second = pipeline.retry_indexing(&conv).await?;
    println!("retry again (accepted={}): {:?}", second.is_accepted(), second.status());

    pipeline
        .enqueue(
            SummarizeConversation {
                conversation_id: conv.clone(),
                force: false,
            },
            Default::default(),
        )
        .await?;

    // (D) agent task の進捗を記録する
    let recorder = pipeline.recorder();
    let task = recorder.create_task("user-1", "summarize research").await?;
    recorder
        .record_event(task.task_id, TaskEventType::StatusChange, serde_json::json!({ "status": "running" }))
        .await?;
    recorder
        .record_event(task.task_id, TaskEventType::ToolCall, serde_json::json!({ "tool_name": "search" }))
        .await?;

    // (E) 終端状態になるまでポーリング
    loop {
        let Some(status) = pipeline.entity_status(&conv).await? else {
            break;
        };
        if matches!(status.indexing_status, IndexingStatus::Indexed | IndexingStatus::Error) {
            println!("final status: {status:?}");
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }

    println!("queues: {:?}", pipeline.all_queue_stats().await?);
    println!("aggregate: {:?}", pipeline.aggregate_status().await?);
    if let Some(detail) = recorder.recall_task(task.task_id).await? {
        println!(
            "task {}: status={:?} tool_calls={} events={}",
            detail.task.task_id,
            detail.task.status,
            detail.task.tool_call_count,
            detail.events.len()
        );
    }

    running.shutdown().await;
    Ok(())
}

use criterion::{Criterion, criterion_group, criterion_main};
use serde_json::json;

use omnigate::agent::context::{CompactionStrategy, ContextConfig, ContextManager};
use omnigate::agent::message::{Message, ToolCall};

fn busy_config() -> ContextConfig {
    ContextConfig {
        max_tokens: 4_000,
        max_messages: 120,
        compaction_threshold: 0.8,
        compaction_target: 0.4,
        strategy: CompactionStrategy::DropOldest,
        ..Default::default()
    }
}

async fn fill_and_compact(rounds: usize) {
    let mut ctx = ContextManager::new(busy_config());
    ctx.set_system_prompt("You are a helpful personal assistant.");
    for i in 0..rounds {
        ctx.add_message(Message::user(format!("question number {i} with some padding text")))
            .await;
        let id = format!("tc_{i}");
        ctx.add_message(Message::assistant("").with_tool_calls(vec![ToolCall::new(
            &id,
            "file_read",
            json!({"path": format!("file_{i}.txt")}),
        )]))
        .await;
        ctx.add_message(Message::tool_result(&id, "result payload ".repeat(16)))
            .await;
        ctx.add_message(Message::assistant("summarised answer ".repeat(8)))
            .await;
    }
    ctx.compact().await;
}

fn bench_compaction(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("context_fill_and_compact_50_rounds", |b| {
        b.to_async(&rt).iter(|| fill_and_compact(50));
    });

    c.bench_function("context_fill_and_compact_200_rounds", |b| {
        b.to_async(&rt).iter(|| fill_and_compact(200));
    });
}

criterion_group!(benches, bench_compaction);
criterion_main!(benches);

use chatlog_core::{
    pipeline::{run_batch, BatchOptions, ConversationPipeline, Silent},
    stream::ExportStream,
    SchemaRegistry,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Map, Value};
use std::io::Cursor;

/// A conversation of `turns` user/assistant pairs with one abandoned edit.
fn synthetic_conversation(id: usize, turns: usize) -> Value {
    let mut mapping = Map::new();
    mapping.insert(
        "root".into(),
        json!({"id": "root", "parent": null, "children": ["n0", "edit"], "message": null}),
    );
    mapping.insert(
        "edit".into(),
        json!({"id": "edit", "parent": "root", "children": [], "message": {
            "author": {"role": "user"}, "weight": 0.0,
            "content": {"content_type": "text", "parts": ["abandoned"]}
        }}),
    );

    let len = turns * 2;
    for i in 0..len {
        let parent = if i == 0 { "root".to_owned() } else { format!("n{}", i - 1) };
        let children: Vec<String> = if i + 1 < len { vec![format!("n{}", i + 1)] } else { vec![] };
        let role = if i % 2 == 0 { "user" } else { "assistant" };
        mapping.insert(
            format!("n{i}"),
            json!({"id": format!("n{i}"), "parent": parent, "children": children, "message": {
                "author": {"role": role},
                "create_time": 1_700_000_000.0 + i as f64,
                "content": {"content_type": "text", "parts": [format!("turn {i} of conversation {id} ").repeat(8)]},
                "metadata": {"citations": [], "content_references": []}
            }}),
        );
    }

    json!({
        "id": format!("conv-{id}"),
        "title": format!("Synthetic {id}"),
        "create_time": 1_700_000_000.0,
        "current_node": format!("n{}", len - 1),
        "mapping": mapping,
    })
}

fn synthetic_export(conversations: usize, turns: usize) -> Vec<Value> {
    (0..conversations).map(|id| synthetic_conversation(id, turns)).collect()
}

fn bench_process_single(c: &mut Criterion) {
    let record = synthetic_conversation(0, 50);

    c.bench_function("ConversationPipeline::process_100_messages", |b| {
        b.iter(|| {
            let mut registry = SchemaRegistry::new();
            let conv = ConversationPipeline::new(&mut registry).process(black_box(&record));
            black_box(conv.is_ok())
        });
    });
}

fn bench_export_stream(c: &mut Criterion) {
    let body = serde_json::to_vec(&Value::Array(synthetic_export(200, 10))).unwrap();

    c.bench_function("ExportStream::parse_200_conversations", |b| {
        b.iter(|| {
            let stream = ExportStream::from_reader(Cursor::new(body.as_slice())).unwrap();
            black_box(stream.filter(Result::is_ok).count())
        });
    });
}

fn bench_batch_workers(c: &mut Criterion) {
    let records = synthetic_export(500, 10);
    let mut group = c.benchmark_group("run_batch");

    for jobs in [1usize, 4] {
        group.bench_with_input(BenchmarkId::from_parameter(jobs), &jobs, |b, &jobs| {
            let options = BatchOptions {
                jobs,
                ..Default::default()
            };
            b.iter(|| {
                let outcome = run_batch(records.clone(), &options, &Silent).unwrap();
                black_box(outcome.conversations.len())
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_process_single,
    bench_export_stream,
    bench_batch_workers
);
criterion_main!(benches);

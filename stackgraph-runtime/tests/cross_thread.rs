//! Worker threads adopting the main thread's open scope land beneath it in
//! the merged graph.

use stackgraph::ScopeId;
use stackgraph_runtime::{adopt, collect_all, enter, flush, fork, records, Measurements};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn burn(iterations: u64) -> u64 {
    let mut acc = 0u64;
    for i in 0..iterations {
        acc = acc.wrapping_mul(31).wrapping_add(i);
    }
    std::hint::black_box(acc)
}

fn parent_label(graph: &stackgraph::GraphData<Measurements>, label: &str) -> Option<ScopeId> {
    let id = ScopeId::from_label(label);
    let (node, _) = graph.pre_order().find(|(_, n)| n.id() == id && !n.is_dummy())?;
    let parent = graph.parent(node)?;
    Some(graph.get(parent)?.id())
}

#[test]
fn scoped_workers_nest_under_forking_scope() {
    init_tracing();
    {
        let _run = enter("xt_run");
        let ctx = fork().expect("scope is open");
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(move || {
                    let _adopted = adopt(&ctx);
                    for _ in 0..5 {
                        let _work = enter("xt_work");
                        burn(10_000);
                    }
                });
            }
        });
    }

    let graph = collect_all();
    assert_eq!(parent_label(&graph, "xt_work"), Some(ScopeId::from_label("xt_run")));

    let records = records();
    let work = records.iter().find(|r| r.label == "xt_work").unwrap();
    assert_eq!(work.calls, 20);
    assert_eq!(work.depth, 2);
    let run = records.iter().find(|r| r.label == "xt_run").unwrap();
    assert_eq!(run.calls, 1);
}

#[test]
fn plain_threads_merge_on_exit() {
    init_tracing();
    let handles: Vec<_> = (0..3)
        .map(|_| {
            std::thread::spawn(|| {
                let _job = enter("xt_job");
                burn(1_000);
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let records = records();
    let job = records.iter().find(|r| r.label == "xt_job").unwrap();
    assert_eq!(job.calls, 3);
    assert_eq!(job.depth, 1);
}

#[test]
fn worker_with_open_scope_keeps_it_across_adoption() {
    init_tracing();
    {
        let _serve = enter("xt_serve");
        let ctx = fork().expect("scope is open");
        std::thread::scope(|s| {
            s.spawn(move || {
                {
                    let _own = enter("xt_own");
                    {
                        let _adopted = adopt(&ctx);
                        let _task = enter("xt_task");
                    }
                    let _tail = enter("xt_tail");
                }
                flush();
            });
        });
    }

    let graph = collect_all();
    assert_eq!(parent_label(&graph, "xt_task"), Some(ScopeId::from_label("xt_serve")));
    assert_eq!(parent_label(&graph, "xt_tail"), Some(ScopeId::from_label("xt_own")));

    let records = records();
    let own = records.iter().find(|r| r.label == "xt_own").unwrap();
    assert_eq!(own.calls, 1);
    assert_eq!(own.depth, 1);
}

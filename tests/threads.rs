//! End-to-end: several threads record into their own storage, some mounted
//! under the main thread's open scope, and everything lands in one registry.

use std::sync::Arc;

use stackgraph::{GraphData, Laps, Registry, ScopeId, Settings, ThreadStorage};
use tracing_subscriber::EnvFilter;

type B = (Laps,);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn count_at(g: &GraphData<B>, path: &[&str]) -> Option<u64> {
    let mut cursor = g.head()?;
    for label in path {
        let id = ScopeId::from_label(label);
        cursor = g
            .tree()
            .children(cursor)
            .find(|(_, n)| n.id() == id && !n.is_dummy())
            .map(|(child, _)| child)?;
    }
    Some(g.get(cursor)?.bundle().0.count())
}

#[test]
fn workers_attach_below_the_forking_scope() {
    init_tracing();
    let registry = Arc::new(Registry::<B>::new(Settings::default()));
    let mut main = ThreadStorage::new(Arc::clone(&registry));

    let run = main.enter_label("run").unwrap();
    let cursor = main.fork().unwrap();

    std::thread::scope(|s| {
        for _ in 0..4 {
            let registry = Arc::clone(&registry);
            s.spawn(move || {
                let mut worker = ThreadStorage::new(registry);
                worker.adopt(cursor).unwrap();
                for _ in 0..3 {
                    let task = worker.enter_label("task").unwrap();
                    let step = worker.enter_label("step").unwrap();
                    worker.exit(step);
                    worker.exit(task);
                }
                worker.detach();
                // merge_on_drop folds the worker in at thread exit
            });
        }
    });

    main.exit(run);
    main.finalize().unwrap();

    let merged = registry.finalize();
    assert_eq!(count_at(&merged, &["run"]), Some(1));
    assert_eq!(count_at(&merged, &["run", "task"]), Some(12));
    assert_eq!(count_at(&merged, &["run", "task", "step"]), Some(12));
    assert_eq!(merged.aggregate().0.count(), 25);

    let anchors = merged
        .pre_order()
        .filter(|(id, n)| n.is_dummy() && Some(*id) != merged.head())
        .count();
    assert_eq!(anchors, 0, "every worker anchor resolved to `run`");
}

#[test]
fn independent_threads_merge_by_path() {
    init_tracing();
    let registry = Arc::new(Registry::<B>::new(Settings::default()));

    std::thread::scope(|s| {
        for i in 0..3 {
            let registry = Arc::clone(&registry);
            s.spawn(move || {
                let mut ts = ThreadStorage::new(registry);
                let main = ts.enter_label("main").unwrap();
                let leaf = if i % 2 == 0 { "even" } else { "odd" };
                let f = ts.enter_label(leaf).unwrap();
                ts.exit(f);
                ts.exit(main);
                ts.finalize().unwrap();
            });
        }
    });

    let merged = registry.finalize();
    assert_eq!(count_at(&merged, &["main"]), Some(3));
    assert_eq!(count_at(&merged, &["main", "even"]), Some(2));
    assert_eq!(count_at(&merged, &["main", "odd"]), Some(1));
    assert_eq!(merged.len(), 4);
}

#[test]
fn registry_reset_starts_a_new_interval() {
    init_tracing();
    let registry = Arc::new(Registry::<B>::new(Settings::default()));
    let mut ts = ThreadStorage::new(Arc::clone(&registry));

    let f = ts.enter_label("phase").unwrap();
    ts.exit(f);
    ts.finalize().unwrap();
    registry.reset();

    let f = ts.enter_label("phase").unwrap();
    ts.exit(f);
    ts.finalize().unwrap();

    let merged = registry.finalize();
    assert_eq!(count_at(&merged, &["phase"]), Some(1));
}

#[test]
fn merged_graph_serializes_to_json() {
    let registry = Arc::new(Registry::<B>::new(Settings::default()));
    let mut ts = ThreadStorage::new(Arc::clone(&registry));
    let f = ts.enter_label("main").unwrap();
    ts.exit(f);
    ts.finalize().unwrap();

    let json = serde_json::to_value(registry.finalize()).unwrap();
    let main = &json["graph"][0]["children"][0]["value"];
    assert_eq!(main["id"], ScopeId::from_label("main").0);
    assert_eq!(main["bundle"][0]["count"], 1);
    assert_eq!(main["dummy"], false);
}

use banyan_reactive::*;
use criterion::{criterion_group, criterion_main, Criterion};

fn trigger_effect(c: &mut Criterion) {
    c.bench_function("trigger_effect", |b| {
        let root = create_root(|| {});
        root.run_in(|| {
            let state = reactive_obj(record! { n: 0 });
            effect(move |_| {
                let _ = state.get("n");
            });
            let mut i = 0i64;
            b.iter(|| {
                i += 1;
                state.set("n", i.into()).unwrap();
            });
        });
        root.dispose();
    });
}

fn deep_watch_bubble(c: &mut Criterion) {
    c.bench_function("deep_watch_bubble", |b| {
        let root = create_root(|| {});
        root.run_in(|| {
            let state = reactive_obj(record! {
                user: record! { profile: record! { age: 0 } }
            });
            deep_watch(&state.into(), |_| {}, Default::default()).unwrap();
            let profile = state
                .get("user")
                .as_obj()
                .unwrap()
                .get("profile")
                .as_obj()
                .unwrap();
            let mut i = 0i64;
            b.iter(|| {
                i += 1;
                profile.set("age", i.into()).unwrap();
            });
        });
        root.dispose();
    });
}

fn recursive_diff_replace(c: &mut Criterion) {
    c.bench_function("recursive_diff_replace", |b| {
        let root = create_root(|| {});
        root.run_in(|| {
            let holder = reactive_obj(record! { value: record! { a: 0, b: 0, c: 0 } });
            effect(move |_| {
                let value = holder.get("value").as_obj().unwrap();
                let _ = value.get("a");
            });
            let mut i = 0i64;
            b.iter(|| {
                i += 1;
                let replacement = record! { a: i, b: 0, c: 0 };
                holder.set("value", replacement.into()).unwrap();
            });
        });
        root.dispose();
    });
}

criterion_group!(benches, trigger_effect, deep_watch_bubble, recursive_diff_replace);
criterion_main!(benches);

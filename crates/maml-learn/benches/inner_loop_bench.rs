use candle_core::Device;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use maml_core::sampling::fixed_count;
use maml_core::tasks::{SineConfig, SineFamily};
use maml_core::TaskDistribution;
use maml_learn::{build_learner, Feed, GradMode, MamlConfig};

fn sine_feed(is_training: bool) -> Feed {
    let mut family = SineFamily::new(SineConfig::default(), 0);
    let mut task = family.sample(1).unwrap().remove(0);
    Feed::from_sample(task.sample(10, 10).unwrap(), is_training, &Device::Cpu).unwrap()
}

fn bench_adapt_detached(c: &mut Criterion) {
    let learner = build_learner(&MamlConfig::default(), &Device::Cpu).unwrap();
    let replica = &learner.replicas()[0];
    let feed = sine_feed(false);
    c.bench_function("adapt 3 steps (detached)", |b| {
        b.iter(|| {
            let inputs = maml_learn::AdaptInputs {
                x_c: &feed.x_c,
                y_c: &feed.y_c,
                x_t: &feed.x_t,
            };
            black_box(
                replica
                    .adapter()
                    .adapt(&learner.params().initial_weights(), inputs, GradMode::Detached)
                    .unwrap(),
            )
        })
    });
}

fn bench_meta_gradient(c: &mut Criterion) {
    let mut learner = build_learner(&MamlConfig::default(), &Device::Cpu).unwrap();
    // Bind replica 0 through a real step, then time its meta-gradient alone.
    learner.train(4, fixed_count(10), fixed_count(10)).unwrap();
    let replica = &learner.replicas()[0];
    c.bench_function("meta_gradient (second order, 1 step)", |b| {
        b.iter(|| black_box(replica.meta_gradient().unwrap()))
    });
}

fn bench_train_step(c: &mut Criterion) {
    let mut learner = build_learner(&MamlConfig::default(), &Device::Cpu).unwrap();
    c.bench_function("train (4 replicas)", |b| {
        b.iter(|| black_box(learner.train(4, fixed_count(10), fixed_count(10)).unwrap()))
    });
}

fn bench_evaluate(c: &mut Criterion) {
    let mut learner = build_learner(&MamlConfig::default(), &Device::Cpu).unwrap();
    c.bench_function("evaluate (8 tasks)", |b| {
        b.iter(|| black_box(learner.evaluate(8, fixed_count(10), fixed_count(10)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_adapt_detached,
    bench_meta_gradient,
    bench_train_step,
    bench_evaluate,
);
criterion_main!(benches);

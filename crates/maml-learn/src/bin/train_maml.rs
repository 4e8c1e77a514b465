//! MAML training CLI for Maml X.
//!
//! Meta-trains a model on a reference task family and reports
//! post-adaptation metrics after 1, 2 and 3 inner steps.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release -p maml-learn --bin train-maml -- \
//!   --family sine --nr-model 4 --inner-iters 1 --alpha 0.01 \
//!   --epochs 50 --steps-per-epoch 1000 --eval-interval 5 --save-interval 10 \
//!   --checkpoint-dir checkpoints --tag mlp2 --tag k5
//! ```
//!
//! `--config run.json` loads a full [`MamlConfig`] first; flags given after
//! it override its fields.

use std::path::PathBuf;

use candle_core::Device;
use maml_core::tasks::BlobConfig;
use maml_learn::{build_learner, run_train, CheckpointStore, CountPolicy, FamilyConfig, MamlConfig};
use maml_nn::{MlpConfig, ModelSpec};

fn main() {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    let config = parse_args(&args);

    eprintln!("=== Maml X Meta-Training ===");
    eprintln!("Task type:   {}", config.task_type);
    eprintln!("Replicas:    {}", config.nr_model);
    eprintln!(
        "Inner:       alpha={} iters={} eval_iters={}",
        config.inner.alpha, config.inner.inner_iters, config.inner.eval_iters
    );
    eprintln!("Outer lr:    {}", config.outer.lr);
    eprintln!(
        "Epochs:      {} x {} steps",
        config.schedule.num_epoch, config.schedule.steps_per_epoch
    );
    eprintln!("Checkpoints: {}", config.checkpoint_dir.display());
    eprintln!();

    let mut learner = build_learner(&config, &Device::Cpu).unwrap_or_else(|e| {
        eprintln!("ERROR: failed to build learner: {e}");
        std::process::exit(1);
    });
    let store = CheckpointStore::new(config.checkpoint_dir.clone());
    let shots = config.shots.sampler(config.seed.wrapping_add(3));
    let queries = config.queries.sampler(config.seed.wrapping_add(4));

    let report = run_train(&mut learner, &config.schedule, shots, queries, &store)
        .unwrap_or_else(|e| {
            eprintln!("ERROR: training failed: {e}");
            std::process::exit(1);
        });

    eprintln!();
    eprintln!("=== Done ===");
    if let Some(loss) = report.train_loss.last() {
        eprintln!("Final train loss: {loss:.4}");
    }
    if let Some(eval) = report.last_eval() {
        eprintln!("Final eval (epoch {}): {:?}", eval.epoch, eval.metrics);
    }
    if let Some(path) = report.checkpoints.last() {
        eprintln!("Last checkpoint:  {}", path.display());
    }
}

fn parse_args(args: &[String]) -> MamlConfig {
    let mut config = MamlConfig::default();
    let mut meta_batch_set = false;
    let mut tags_set = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let path = PathBuf::from(value(args, i, "--config"));
                config = MamlConfig::from_json_file(&path).unwrap_or_else(|e| {
                    eprintln!("ERROR: {e}");
                    std::process::exit(1);
                });
            }
            "--family" => {
                i += 1;
                match value(args, i, "--family") {
                    "sine" => {
                        config.family = FamilyConfig::default();
                        config.task_type = "regression".to_string();
                        config.model = ModelSpec::Mlp(MlpConfig::mlp2(1));
                    }
                    "blobs" => {
                        let blobs = BlobConfig::default();
                        config.model = ModelSpec::Mlp(MlpConfig::mlp2(blobs.num_classes));
                        config.family = FamilyConfig::Blobs(blobs);
                        config.task_type = "classification".to_string();
                    }
                    other => {
                        eprintln!("ERROR: unknown family '{other}'. Valid: sine, blobs");
                        std::process::exit(1);
                    }
                }
            }
            "--task-type" => {
                i += 1;
                config.task_type = value(args, i, "--task-type").to_string();
            }
            "--nr-model" => {
                i += 1;
                config.nr_model = parse(args, i, "--nr-model");
            }
            "--meta-batch" => {
                i += 1;
                config.schedule.meta_batch = parse(args, i, "--meta-batch");
                meta_batch_set = true;
            }
            "--alpha" => {
                i += 1;
                config.inner.alpha = parse(args, i, "--alpha");
            }
            "--inner-iters" => {
                i += 1;
                config.inner.inner_iters = parse(args, i, "--inner-iters");
            }
            "--eval-iters" => {
                i += 1;
                config.inner.eval_iters = parse(args, i, "--eval-iters");
            }
            "--first-order" => {
                config.inner.first_order = true;
            }
            "--lr" => {
                i += 1;
                config.outer.lr = parse(args, i, "--lr");
            }
            "--shots" => {
                i += 1;
                config.shots = CountPolicy::Fixed {
                    n: parse(args, i, "--shots"),
                };
            }
            "--queries" => {
                i += 1;
                config.queries = CountPolicy::Fixed {
                    n: parse(args, i, "--queries"),
                };
            }
            "--epochs" => {
                i += 1;
                config.schedule.num_epoch = parse(args, i, "--epochs");
            }
            "--steps-per-epoch" => {
                i += 1;
                config.schedule.steps_per_epoch = parse(args, i, "--steps-per-epoch");
            }
            "--eval-interval" => {
                i += 1;
                config.schedule.eval_interval = parse(args, i, "--eval-interval");
            }
            "--save-interval" => {
                i += 1;
                config.schedule.save_interval = parse(args, i, "--save-interval");
            }
            "--eval-samples" => {
                i += 1;
                config.schedule.eval_samples = parse(args, i, "--eval-samples");
            }
            "--resume" => {
                config.schedule.resume = true;
            }
            "--seed" => {
                i += 1;
                config.seed = parse(args, i, "--seed");
            }
            "--checkpoint-dir" => {
                i += 1;
                config.checkpoint_dir = PathBuf::from(value(args, i, "--checkpoint-dir"));
            }
            "--tag" => {
                i += 1;
                if !tags_set {
                    config.tags.clear();
                    tags_set = true;
                }
                config.tags.push(value(args, i, "--tag").to_string());
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("ERROR: unknown argument '{other}'");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    if !meta_batch_set {
        config.schedule.meta_batch = config.nr_model;
    }
    config
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    args.get(i).map(String::as_str).unwrap_or_else(|| {
        eprintln!("ERROR: {flag} requires a value");
        std::process::exit(1);
    })
}

fn parse<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> T {
    value(args, i, flag).parse().unwrap_or_else(|_| {
        eprintln!("ERROR: invalid value for {flag}");
        std::process::exit(1);
    })
}

fn print_usage() {
    eprintln!("Usage: train-maml [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <PATH>          Load a JSON config first");
    eprintln!("  --family <NAME>          sine | blobs (default: sine)");
    eprintln!("  --task-type <NAME>       regression | classification");
    eprintln!("  --nr-model <N>           Task replicas per meta-batch (default: 4)");
    eprintln!("  --meta-batch <N>         Tasks per meta-update (default: nr-model)");
    eprintln!("  --alpha <F>              Inner step size (default: 0.01)");
    eprintln!("  --inner-iters <N>        Inner steps trained on (default: 1)");
    eprintln!("  --eval-iters <N>         Inner steps unrolled for evaluation (default: 3)");
    eprintln!("  --first-order            Drop second-order terms");
    eprintln!("  --lr <F>                 Outer Adam learning rate (default: 0.001)");
    eprintln!("  --shots <N>              Fixed context examples per task");
    eprintln!("  --queries <N>            Fixed query examples per task");
    eprintln!("  --epochs <N>             Number of epochs (default: 100)");
    eprintln!("  --steps-per-epoch <N>    Meta-updates per epoch (default: 1000)");
    eprintln!("  --eval-interval <N>      Evaluate every N epochs, 0 = never");
    eprintln!("  --save-interval <N>      Checkpoint every N epochs, 0 = never");
    eprintln!("  --eval-samples <N>       Tasks per evaluation (default: 1000)");
    eprintln!("  --resume                 Restore the checkpoint before training");
    eprintln!("  --seed <N>               Seed (default: 42)");
    eprintln!("  --checkpoint-dir <PATH>  Checkpoint root (default: checkpoints)");
    eprintln!("  --tag <TAG>              Run tag, repeatable");
}

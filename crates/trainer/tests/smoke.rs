mod common;

use std::{fs, path::Path};

use common::{classification_batches, copy_weights, ToyClassifier};
use task_trainer::{
    checkpoint::list_checkpoints, load_checkpoint, AdversarialStep, BlockingDataLoader,
    InMemoryDataLoader, MonitorMode, PredictionPolicy, SelfDistillationStep, StandardStep,
    TaskModel, Trainer, TrainingArgs,
};
use tempfile::tempdir;

fn train_loader() -> BlockingDataLoader<InMemoryDataLoader> {
    BlockingDataLoader::new(InMemoryDataLoader::new(classification_batches()).shuffled(7))
}

fn eval_loader() -> BlockingDataLoader<InMemoryDataLoader> {
    BlockingDataLoader::new(InMemoryDataLoader::new(classification_batches()))
}

fn base_args(dir: &Path) -> TrainingArgs {
    let mut args = TrainingArgs::new(dir);
    args.task_name = "cola".to_string();
    args.seed = 17;
    args.train.num_train_epochs = 2;
    args.optimizer.learning_rate = 0.05;
    args.scheduler.warmup_proportion = 0.25;
    args
}

fn flat_parameters(model: &impl TaskModel) -> Vec<f32> {
    model
        .named_parameters()
        .into_iter()
        .flat_map(|(_, var)| {
            var.as_tensor()
                .flatten_all()
                .and_then(|t| t.to_vec1::<f32>())
                .expect("parameters")
        })
        .collect()
}

#[test]
fn smoke_training_with_periodic_eval_and_checkpoints() {
    let tmp = tempdir().expect("tempdir");
    let mut args = base_args(tmp.path());
    args.logging.logging_steps = 2;
    args.logging.evaluate_during_training = true;
    args.logging.tensorboard_dir = Some(tmp.path().join("runs"));
    args.checkpoint.save_steps = 2;
    args.checkpoint.monitor = "eval_mcc".to_string();
    args.checkpoint.mode = MonitorMode::Max;

    let model = ToyClassifier::new(2);
    let initial = flat_parameters(&model);
    let mut trainer =
        Trainer::new(args, model, StandardStep, PredictionPolicy::Classification)
            .expect("trainer");

    let summary = trainer
        .train_with_eval(&mut train_loader(), &mut eval_loader())
        .expect("training");
    assert_eq!(summary.global_step, 8);
    assert_eq!(trainer.global_step(), 8);
    assert!(summary.average_loss.is_finite());
    assert!(trainer.model().training);
    assert_ne!(flat_parameters(trainer.model()), initial);

    let logger = trainer.logger();
    assert_eq!(logger.history("loss").len(), 8);
    assert_eq!(logger.history("learning_rate").len(), 8);
    assert_eq!(logger.history("eval_mcc").len(), 4);
    assert_eq!(logger.history("eval_loss")[0].0, 2);

    let checkpoints = list_checkpoints(tmp.path()).expect("list");
    let names: Vec<String> = checkpoints
        .iter()
        .map(|path| path.file_name().expect("name").to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        ["checkpoint-2", "checkpoint-4", "checkpoint-6", "checkpoint-8"]
    );
    let last = load_checkpoint(&checkpoints[3]).expect("load");
    assert_eq!(last.state.step, 8);
    assert_eq!(last.optimizer_state.expect("optimizer").step, 8);
    assert_eq!(last.scheduler_state.expect("scheduler").step, 8);

    assert!(tmp.path().join("cola_training_history.json").is_file());
    assert!(!tmp.path().join("cola_predict_eval_logits.json").exists());
    let events = fs::read_dir(tmp.path().join("runs"))
        .expect("runs")
        .filter_map(Result::ok)
        .any(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with("events.out.tfevents.")
        });
    assert!(events);
}

#[test]
fn smoke_best_only_with_accumulation_and_max_steps() {
    let tmp = tempdir().expect("tempdir");
    let mut args = base_args(tmp.path());
    args.train.max_steps = Some(3);
    args.train.gradient_accumulation_steps = 2;
    args.checkpoint.save_steps = 1;
    args.checkpoint.save_best_only = true;
    args.checkpoint.monitor = "loss".to_string();

    let mut trainer = Trainer::new(
        args,
        ToyClassifier::new(2),
        StandardStep,
        PredictionPolicy::Classification,
    )
    .expect("trainer");
    let summary = trainer.train(&mut train_loader()).expect("training");
    assert_eq!(summary.global_step, 3);

    let checkpoints = list_checkpoints(tmp.path()).expect("list");
    assert_eq!(checkpoints, vec![tmp.path().join("checkpoint-best")]);
    let best = load_checkpoint(&checkpoints[0]).expect("load");
    assert!(best.state.extras.contains_key("best"));
    assert!((1..=3).contains(&best.state.step));
}

#[test]
fn short_epoch_still_takes_an_optimizer_step() {
    let tmp = tempdir().expect("tempdir");
    let mut args = base_args(tmp.path());
    args.train.max_steps = Some(1);
    args.train.gradient_accumulation_steps = 8;

    let model = ToyClassifier::new(2);
    let initial = flat_parameters(&model);
    let mut trainer =
        Trainer::new(args, model, StandardStep, PredictionPolicy::Classification)
            .expect("trainer");
    let summary = trainer.train(&mut train_loader()).expect("training");
    assert_eq!(summary.global_step, 1);
    assert_ne!(flat_parameters(trainer.model()), initial);

    let mut args = base_args(tmp.path());
    args.train.gradient_accumulation_steps = 3;
    let mut trainer = Trainer::new(
        args,
        ToyClassifier::new(2),
        StandardStep,
        PredictionPolicy::Classification,
    )
    .expect("trainer");
    let summary = trainer.train(&mut train_loader()).expect("training");
    // 4 batches per epoch: one full window of 3 and one trailing window of 1.
    assert_eq!(summary.global_step, 4);
    assert_eq!(trainer.logger().history("loss").len(), 4);
}

#[test]
fn smoke_adversarial_training() {
    let tmp = tempdir().expect("tempdir");
    let mut args = base_args(tmp.path());
    args.train.max_steps = Some(2);
    args.adversarial.k = 2;

    let step = AdversarialStep::new(args.adversarial.clone());
    let mut trainer = Trainer::new(
        args,
        ToyClassifier::new(2),
        step,
        PredictionPolicy::Classification,
    )
    .expect("trainer");
    let summary = trainer.train(&mut train_loader()).expect("training");
    assert_eq!(summary.global_step, 2);
    assert!(summary.average_loss.is_finite());
}

#[test]
fn adversarial_runs_repeat_with_the_same_seed() {
    let base = ToyClassifier::new(2);
    let start = flat_parameters(&base);
    let run = |seed: u64| {
        let tmp = tempdir().expect("tempdir");
        let mut args = base_args(tmp.path());
        args.seed = seed;
        args.train.max_steps = Some(2);
        args.adversarial.var = 0.5;

        let student = ToyClassifier::new(2);
        copy_weights(&student, &base);
        let step = AdversarialStep::new(args.adversarial.clone());
        let mut trainer =
            Trainer::new(args, student, step, PredictionPolicy::Classification)
                .expect("trainer");
        trainer.train(&mut eval_loader()).expect("training");
        flat_parameters(trainer.model())
    };

    let first = run(5);
    assert_ne!(first, start);
    assert_eq!(run(5), first);
}

#[test]
fn smoke_self_distillation_moves_teacher() {
    let tmp = tempdir().expect("tempdir");
    let args = base_args(tmp.path());

    let student = ToyClassifier::new(2);
    let teacher = ToyClassifier::new(2);
    copy_weights(&teacher, &student);
    let start = flat_parameters(&teacher);

    let step = SelfDistillationStep::new(teacher, args.distillation.clone());
    let mut trainer = Trainer::new(args, student, step, PredictionPolicy::Classification)
        .expect("trainer");
    let summary = trainer.train(&mut train_loader()).expect("training");
    assert_eq!(summary.global_step, 8);

    let teacher = flat_parameters(trainer.step_strategy().teacher());
    let student = flat_parameters(trainer.model());
    assert_ne!(teacher, start);
    assert_ne!(teacher, student);
}

use std::fs;
use std::io::Write;
use std::path::Path;

use training::{
    RecordDataset, SessionOptions, Trainer, TrainingConfig, TrainingError,
};

const SHAPE: [usize; 3] = [3, 8, 8];
const CLASSES: usize = 4;

fn write_split(dir: &Path, split: &str, examples: usize) {
    let [c, h, w] = SHAPE;
    let mut file = fs::File::create(dir.join(format!("{split}.bin"))).unwrap();
    for index in 0..examples {
        let mut record = vec![(index % CLASSES) as u8];
        record.extend((0..c * h * w).map(|i| ((index * 37 + i * 11) % 256) as u8));
        file.write_all(&record).unwrap();
    }
}

fn tiny_config() -> TrainingConfig {
    let mut config = TrainingConfig::default();
    config.model.num_classes = CLASSES;
    config.model.input_shape = SHAPE;
    config.model.filters = vec![4, 8];
    config.model.blocks = vec![1, 1];
    config.model.strides = vec![1, 2];
    config.data.batch_size = 4;
    config.data.eval_batch_size = 8;
    config.data.epochs = 1;
    config.data.augment = false;
    config.optimizer.learning_rates = vec![0.05, 0.005];
    config.optimizer.decay_boundaries = vec![4];
    config.optimizer.weight_decay = 0.0;
    config.runtime.seed = 11;
    config.runtime.log_every = 1;
    config.runtime.save_every = 1;
    config.runtime.warmup_steps = 1;
    config.runtime.max_checkpoints = Some(2);
    config
}

fn session(data_dir: &Path, train_dir: Option<&Path>) -> SessionOptions {
    SessionOptions {
        data_dir: data_dir.to_path_buf(),
        train_dir: train_dir.map(|dir| dir.to_path_buf()),
        restore: false,
        validate: false,
        manual_grad: false,
    }
}

#[test]
fn missing_data_dir_fails_before_initialization() {
    let missing = Path::new("/definitely/not/a/real/data/dir");
    match Trainer::new(tiny_config(), session(missing, None)) {
        Ok(_) => panic!("expected initialization failure for a missing data directory"),
        Err(TrainingError::Initialization(message)) => {
            assert!(message.contains("does not exist"), "{message}");
        }
        Err(other) => panic!("expected initialization error, got {other}"),
    }
}

#[test]
fn single_iteration_reaches_step_one() {
    let data = tempfile::tempdir().unwrap();
    write_split(data.path(), "train_all", 4);
    write_split(data.path(), "test", 4);

    let mut trainer = Trainer::new(tiny_config(), session(data.path(), None)).unwrap();
    assert_eq!(trainer.global_step(), 0);
    trainer.train().unwrap();
    assert_eq!(trainer.global_step(), 1);
}

#[test]
fn checkpoints_are_written_and_pruned() {
    let data = tempfile::tempdir().unwrap();
    let train_dir = tempfile::tempdir().unwrap();
    write_split(data.path(), "train_all", 12);
    write_split(data.path(), "test", 4);

    let mut trainer =
        Trainer::new(tiny_config(), session(data.path(), Some(train_dir.path()))).unwrap();
    trainer.train().unwrap();
    assert_eq!(trainer.global_step(), 3);

    let mut names: Vec<String> = fs::read_dir(train_dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    // max_checkpoints = 2, so the step-1 checkpoint is pruned.
    assert_eq!(names, vec!["ckpt_step_000000000002", "ckpt_step_000000000003"]);

    let latest = training::checkpoint::latest_checkpoint(train_dir.path())
        .unwrap()
        .unwrap();
    assert_eq!(latest.manifest.progress.global_step, 3);
}

#[test]
fn restore_resumes_the_global_step() {
    let data = tempfile::tempdir().unwrap();
    let train_dir = tempfile::tempdir().unwrap();
    write_split(data.path(), "train_all", 12);
    write_split(data.path(), "test", 4);

    let mut first =
        Trainer::new(tiny_config(), session(data.path(), Some(train_dir.path()))).unwrap();
    first.train().unwrap();
    assert_eq!(first.global_step(), 3);
    drop(first);

    let mut resumed =
        Trainer::new(tiny_config(), session(data.path(), Some(train_dir.path()))).unwrap();
    let descriptor = resumed.resume_from_latest().unwrap().unwrap();
    assert_eq!(descriptor.manifest.progress.global_step, 3);
    assert_eq!(resumed.global_step(), 3);

    // The single configured epoch was fully consumed before the save, so
    // resuming trains no further steps.
    resumed.train().unwrap();
    assert_eq!(resumed.global_step(), 3);
}

#[test]
fn evaluation_is_repeatable_and_bounded() {
    let data = tempfile::tempdir().unwrap();
    write_split(data.path(), "train_all", 8);
    write_split(data.path(), "test", 6);

    let trainer = Trainer::new(tiny_config(), session(data.path(), None)).unwrap();
    let dataset = RecordDataset::open(data.path(), "test", SHAPE).unwrap();

    let first = trainer.evaluate(&dataset).unwrap();
    let second = trainer.evaluate(&dataset).unwrap();

    assert!((0.0..=1.0).contains(&first.accuracy));
    assert!(first.mean_loss >= 0.0);
    assert_eq!(first.examples, 6);
    // Evaluation neither mutates parameters nor leaks accumulator state.
    assert_eq!(first.accuracy, second.accuracy);
    assert_eq!(first.mean_loss, second.mean_loss);
}

#[test]
fn manual_gradient_session_trains() {
    let data = tempfile::tempdir().unwrap();
    write_split(data.path(), "train_all", 4);
    write_split(data.path(), "test", 4);

    let mut options = session(data.path(), None);
    options.manual_grad = true;
    let mut trainer = Trainer::new(tiny_config(), options).unwrap();
    trainer.train().unwrap();
    assert_eq!(trainer.global_step(), 1);
}

#[test]
fn validation_split_is_used_when_requested() {
    let data = tempfile::tempdir().unwrap();
    write_split(data.path(), "train", 8);
    write_split(data.path(), "train_all", 12);
    write_split(data.path(), "validation", 4);
    write_split(data.path(), "test", 4);

    let mut options = session(data.path(), None);
    options.validate = true;
    let mut trainer = Trainer::new(tiny_config(), options).unwrap();
    trainer.train().unwrap();
    // Training iterates the reduced split: 8 examples / batch 4 = 2 steps.
    assert_eq!(trainer.global_step(), 2);
}

#[test]
fn validate_flag_requires_the_held_out_splits() {
    let data = tempfile::tempdir().unwrap();
    write_split(data.path(), "train_all", 8);
    write_split(data.path(), "test", 4);

    let mut options = session(data.path(), None);
    options.validate = true;
    match Trainer::new(tiny_config(), options) {
        Ok(_) => panic!("expected initialization failure without held-out splits"),
        Err(err) => assert!(matches!(err, TrainingError::Initialization(_))),
    }
}

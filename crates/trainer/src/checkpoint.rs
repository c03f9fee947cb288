use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    model::{ModelSaveHook, WEIGHTS_NAME},
    optimizer::{OptimizerState, TrainerOptimizer},
    scheduler::{LRScheduler, SchedulerState},
    TrainingArgs, TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const CHECKPOINT_PREFIX: &str = "checkpoint";
pub const ARGS_FILENAME: &str = "training_args.bin";
pub const OPTIMIZER_FILENAME: &str = "optimizer.pt";
pub const SCHEDULER_FILENAME: &str = "scheduler.pt";
pub const STATE_FILENAME: &str = "state.bin";
pub const MANIFEST_FILENAME: &str = "manifest.json";
const STAGING_SUFFIX: &str = ".partial";
const RETIRED_SUFFIX: &str = ".old";

/// Direction in which the monitored metric improves.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MonitorMode {
    #[default]
    Min,
    Max,
}

impl FromStr for MonitorMode {
    type Err = TrainingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            other => Err(TrainingError::validation(vec![format!(
                "monitor mode must be 'min' or 'max', got '{other}'"
            )])),
        }
    }
}

/// Best value seen so far and where it was written.
#[derive(Debug, Clone)]
pub struct BestMetricTracker {
    mode: MonitorMode,
    best: f64,
    path: Option<PathBuf>,
}

impl BestMetricTracker {
    pub fn new(mode: MonitorMode) -> Self {
        let best = match mode {
            MonitorMode::Min => f64::INFINITY,
            MonitorMode::Max => f64::NEG_INFINITY,
        };
        Self {
            mode,
            best,
            path: None,
        }
    }

    /// Strict comparison; NaN never improves.
    pub fn is_improvement(&self, value: f64) -> bool {
        match self.mode {
            MonitorMode::Min => value < self.best,
            MonitorMode::Max => value > self.best,
        }
    }

    /// Replaces the best when `value` improves on it.
    pub fn update(&mut self, value: f64, path: Option<PathBuf>) -> bool {
        if !self.is_improvement(value) {
            return false;
        }
        self.best = value;
        self.path = path;
        true
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn mode(&self) -> MonitorMode {
        self.mode
    }
}

/// Everything a checkpoint may persist.
///
/// The model, optimizer, scheduler and args references are taken out once
/// written so a reused state never persists them twice.
pub struct TrainingState<'a> {
    pub model: Option<ModelSaveHook<'a>>,
    pub optimizer: Option<&'a TrainerOptimizer>,
    pub scheduler: Option<&'a dyn LRScheduler>,
    pub args: Option<&'a TrainingArgs>,
    pub step: usize,
    pub extras: BTreeMap<String, serde_json::Value>,
}

impl<'a> TrainingState<'a> {
    pub fn new(step: usize) -> Self {
        Self {
            model: None,
            optimizer: None,
            scheduler: None,
            args: None,
            step,
            extras: BTreeMap::new(),
        }
    }

    pub fn with_model(mut self, model: ModelSaveHook<'a>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_optimizer(mut self, optimizer: &'a TrainerOptimizer) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn with_scheduler(mut self, scheduler: &'a dyn LRScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_args(mut self, args: &'a TrainingArgs) -> Self {
        self.args = Some(args);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extras.insert(key.into(), value);
        self
    }
}

/// What remains of a [`TrainingState`] after the heavy objects are written.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StateBlob {
    pub step: usize,
    #[serde(default)]
    pub extras: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Written last; a directory without one is not a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub step: usize,
    pub files: Vec<FileRecord>,
}

impl CheckpointManifest {
    pub fn file(&self, filename: &str) -> Option<&FileRecord> {
        self.files.iter().find(|record| record.filename == filename)
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

/// Writes `state` into `directory`, replacing whatever was there.
///
/// Artifacts are assembled in a sibling `<name>.partial` directory which is
/// renamed into place once the manifest has been written.
pub fn save_checkpoint(
    state: &mut TrainingState<'_>,
    directory: &Path,
) -> Result<CheckpointDescriptor, TrainingError> {
    let Some(model) = state.model.take() else {
        return Err(TrainingError::precondition(
            "checkpoint state carries no model",
        ));
    };

    let staging = sibling_dir(directory, STAGING_SUFFIX)?;
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            staging.display()
        ))
    })?;

    log::info!("Saving model checkpoint to {}", directory.display());
    model.write(&staging)?;

    if let Some(args) = state.args.take() {
        write_json(&staging.join(ARGS_FILENAME), args)?;
    }

    if let Some(optimizer) = state.optimizer.take() {
        log::info!(
            "Saving optimizer and scheduler states to {}",
            directory.display()
        );
        write_json(&staging.join(OPTIMIZER_FILENAME), &optimizer.state()?)?;
    }

    if let Some(scheduler) = state.scheduler.take() {
        write_json(&staging.join(SCHEDULER_FILENAME), &scheduler.state())?;
    }

    let blob = StateBlob {
        step: state.step,
        extras: state.extras.clone(),
    };
    write_json(&staging.join(STATE_FILENAME), &blob)?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        step: state.step,
        files: file_records(&staging)?,
    };
    write_json(&staging.join(MANIFEST_FILENAME), &manifest)?;

    // The previous checkpoint stays on disk until the new one is in place.
    let retired = sibling_dir(directory, RETIRED_SUFFIX)?;
    if retired.exists() {
        fs::remove_dir_all(&retired)?;
    }
    let replacing = directory.exists();
    if replacing {
        fs::rename(directory, &retired)?;
    }
    fs::rename(&staging, directory).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to move checkpoint into {}: {err}",
            directory.display()
        ))
    })?;
    if replacing {
        fs::remove_dir_all(&retired)?;
    }

    Ok(CheckpointDescriptor {
        directory: directory.to_path_buf(),
        manifest,
    })
}

/// Decides when a training state is worth persisting.
#[derive(Debug)]
pub struct CheckpointManager {
    root: PathBuf,
    monitor: String,
    save_best_only: bool,
    tracker: BestMetricTracker,
}

impl CheckpointManager {
    pub fn new(
        root: impl Into<PathBuf>,
        monitor: impl Into<String>,
        mode: MonitorMode,
        save_best_only: bool,
    ) -> Result<Self, TrainingError> {
        let root = root.into();
        let monitor = monitor.into();

        let mut errors = Vec::new();
        if root.as_os_str().is_empty() {
            errors.push("checkpoint directory must not be empty".to_string());
        }
        if monitor.trim().is_empty() {
            errors.push("monitored metric name must not be empty".to_string());
        }
        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        fs::create_dir_all(&root).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create checkpoint directory {}: {err}",
                root.display()
            ))
        })?;

        Ok(Self {
            root,
            monitor,
            save_best_only,
            tracker: BestMetricTracker::new(mode),
        })
    }

    pub fn from_args(args: &TrainingArgs) -> Result<Self, TrainingError> {
        Self::new(
            &args.output_dir,
            &args.checkpoint.monitor,
            args.checkpoint.mode,
            args.checkpoint.save_best_only,
        )
    }

    pub fn monitor(&self) -> &str {
        &self.monitor
    }

    pub fn tracker(&self) -> &BestMetricTracker {
        &self.tracker
    }

    /// Where a checkpoint for `step` lands under the current policy.
    pub fn output_dir(&self, step: usize) -> PathBuf {
        if self.save_best_only {
            self.root.join(format!("{CHECKPOINT_PREFIX}-best"))
        } else {
            self.root.join(format!("{CHECKPOINT_PREFIX}-{step}"))
        }
    }

    /// Persists `state` if the policy asks for it; returns where it went.
    pub fn step(
        &mut self,
        state: &mut TrainingState<'_>,
        current: f64,
    ) -> Result<Option<PathBuf>, TrainingError> {
        let directory = self.output_dir(state.step);

        if self.save_best_only {
            if !self.tracker.is_improvement(current) {
                return Ok(None);
            }
            log::info!(
                " Steps {}: {} improved from {:.5} to {:.5}",
                state.step,
                self.monitor,
                self.tracker.best(),
                current
            );
            state
                .extras
                .insert("best".to_string(), serde_json::json!(current));
            save_checkpoint(state, &directory)?;
            self.tracker.update(current, Some(directory.clone()));
            return Ok(Some(directory));
        }

        if directory.exists() {
            log::debug!(
                "checkpoint {} already exists; skipping",
                directory.display()
            );
            return Ok(None);
        }
        log::info!(
            " Step {} - {}: {:.5} save model to disk.",
            state.step,
            self.monitor,
            current
        );
        save_checkpoint(state, &directory)?;
        self.tracker.update(current, Some(directory.clone()));
        Ok(Some(directory))
    }
}

/// A verified checkpoint read back from disk.
#[derive(Debug)]
pub struct LoadedCheckpoint {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
    pub args: Option<TrainingArgs>,
    pub optimizer_state: Option<OptimizerState>,
    pub scheduler_state: Option<SchedulerState>,
    pub state: StateBlob,
    pub model_weights_path: Option<PathBuf>,
}

pub fn load_checkpoint(directory: &Path) -> Result<LoadedCheckpoint, TrainingError> {
    let manifest = load_manifest(directory)?;
    if manifest.version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported checkpoint version {} (expected {})",
            manifest.version, CHECKPOINT_VERSION
        )));
    }
    for record in &manifest.files {
        validate_file(&directory.join(&record.filename), &record.sha256)?;
    }

    let read_optional = |name: &str| -> Option<PathBuf> {
        manifest.file(name).map(|record| directory.join(&record.filename))
    };

    let args = read_optional(ARGS_FILENAME)
        .map(|path| read_json(&path))
        .transpose()?;
    let optimizer_state = read_optional(OPTIMIZER_FILENAME)
        .map(|path| read_json(&path))
        .transpose()?;
    let scheduler_state = read_optional(SCHEDULER_FILENAME)
        .map(|path| read_json(&path))
        .transpose()?;
    let state = match read_optional(STATE_FILENAME) {
        Some(path) => read_json(&path)?,
        None => {
            return Err(TrainingError::runtime(format!(
                "checkpoint {} has no {STATE_FILENAME}",
                directory.display()
            )))
        }
    };
    let model_weights_path = read_optional(WEIGHTS_NAME);

    Ok(LoadedCheckpoint {
        directory: directory.to_path_buf(),
        manifest,
        args,
        optimizer_state,
        scheduler_state,
        state,
        model_weights_path,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum CheckpointName {
    Step(usize),
    Best,
}

fn parse_checkpoint_name(name: &str) -> Option<CheckpointName> {
    let suffix = name.strip_prefix(CHECKPOINT_PREFIX)?.strip_prefix('-')?;
    if suffix == "best" {
        return Some(CheckpointName::Best);
    }
    suffix.parse().ok().map(CheckpointName::Step)
}

/// Complete checkpoints under `root`, by step with `checkpoint-best` last.
pub fn list_checkpoints(root: &Path) -> Result<Vec<PathBuf>, TrainingError> {
    let mut found = Vec::new();
    if !root.exists() {
        return Ok(Vec::new());
    }
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(parsed) = parse_checkpoint_name(&name.to_string_lossy()) else {
            continue;
        };
        if entry.path().join(MANIFEST_FILENAME).is_file() {
            found.push((parsed, entry.path()));
        }
    }
    found.sort();
    Ok(found.into_iter().map(|(_, path)| path).collect())
}

/// Directories to evaluate: a numbered checkpoint, every checkpoint, or the
/// output root itself.
pub fn select_checkpoints(
    root: &Path,
    checkpoint_number: usize,
    all: bool,
) -> Result<Vec<PathBuf>, TrainingError> {
    if checkpoint_number > 0 {
        return Ok(vec![numbered_checkpoint(root, checkpoint_number)?]);
    }
    if all {
        let checkpoints = list_checkpoints(root)?;
        log::info!("Evaluate the following checkpoints: {:?}", checkpoints);
        return Ok(checkpoints);
    }
    Ok(vec![root.to_path_buf()])
}

/// The checkpoint used for prediction; a number is mandatory.
pub fn select_for_prediction(
    root: &Path,
    checkpoint_number: usize,
) -> Result<PathBuf, TrainingError> {
    if checkpoint_number == 0 {
        return Err(TrainingError::validation(vec![
            "checkpoint_number must be greater than 0 to predict".to_string(),
        ]));
    }
    numbered_checkpoint(root, checkpoint_number)
}

/// Step encoded in a checkpoint directory name, if any.
pub fn checkpoint_step(directory: &Path) -> Option<usize> {
    match parse_checkpoint_name(&directory.file_name()?.to_string_lossy())? {
        CheckpointName::Step(step) => Some(step),
        CheckpointName::Best => None,
    }
}

fn numbered_checkpoint(root: &Path, number: usize) -> Result<PathBuf, TrainingError> {
    let directory = root.join(format!("{CHECKPOINT_PREFIX}-{number}"));
    if !directory.join(MANIFEST_FILENAME).is_file() {
        return Err(TrainingError::runtime(format!(
            "no complete checkpoint at {}",
            directory.display()
        )));
    }
    Ok(directory)
}

fn sibling_dir(directory: &Path, suffix: &str) -> Result<PathBuf, TrainingError> {
    let name = directory.file_name().ok_or_else(|| {
        TrainingError::precondition(format!(
            "checkpoint directory {} has no final component",
            directory.display()
        ))
    })?;
    let mut staged = name.to_os_string();
    staged.push(suffix);
    Ok(directory.with_file_name(staged))
}

fn file_records(directory: &Path) -> Result<Vec<FileRecord>, TrainingError> {
    let mut records = Vec::new();
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let filename = entry.file_name().into_string().map_err(|name| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                name.to_string_lossy()
            ))
        })?;
        records.push(FileRecord {
            filename,
            sha256: sha256_file(&path)?,
            bytes: entry.metadata()?.len(),
        });
    }
    records.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(records)
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::runtime(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    if sha256_file(path)? != expected_sha {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

pub(crate) fn write_json<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), TrainingError> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    file.write_all(&data)
        .and_then(|_| file.write_all(b"\n"))
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

pub(crate) fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_requires_strict_improvement() {
        let mut min = BestMetricTracker::new(MonitorMode::Min);
        assert!(min.update(1.0, None));
        assert!(!min.update(1.0, None));
        assert!(!min.update(f64::NAN, None));
        assert!(min.update(0.5, Some(PathBuf::from("a"))));
        assert_eq!(min.best(), 0.5);
        assert_eq!(min.path(), Some(Path::new("a")));

        let mut max = BestMetricTracker::new(MonitorMode::Max);
        assert_eq!(max.best(), f64::NEG_INFINITY);
        assert!(max.update(0.1, None));
        assert!(!max.is_improvement(0.05));
        assert!(max.is_improvement(0.2));
    }

    #[test]
    fn mode_parses_from_str() {
        assert_eq!("max".parse::<MonitorMode>().unwrap(), MonitorMode::Max);
        assert!("median".parse::<MonitorMode>().is_err());
    }

    #[test]
    fn checkpoint_names_order_steps_before_best() {
        assert_eq!(
            parse_checkpoint_name("checkpoint-20"),
            Some(CheckpointName::Step(20))
        );
        assert_eq!(parse_checkpoint_name("checkpoint-best"), Some(CheckpointName::Best));
        assert_eq!(parse_checkpoint_name("checkpoint-20.partial"), None);
        assert_eq!(parse_checkpoint_name("logs"), None);
        assert!(CheckpointName::Step(usize::MAX) < CheckpointName::Best);
        assert_eq!(checkpoint_step(Path::new("/tmp/out/checkpoint-7")), Some(7));
    }

    #[test]
    fn missing_model_fails_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("checkpoint-1");
        let mut state = TrainingState::new(1);
        let err = save_checkpoint(&mut state, &target).unwrap_err();
        assert!(matches!(err, TrainingError::Precondition(_)));
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn empty_monitor_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = CheckpointManager::new(dir.path(), "", MonitorMode::Min, false).unwrap_err();
        assert!(matches!(err, TrainingError::Validation(_)));
    }

    #[test]
    fn failed_best_save_keeps_previous_best() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager =
            CheckpointManager::new(dir.path(), "loss", MonitorMode::Min, true).unwrap();
        let mut state = TrainingState::new(1);
        assert!(manager.step(&mut state, 0.5).is_err());
        assert_eq!(manager.tracker().best(), f64::INFINITY);
        assert!(manager.tracker().path().is_none());
    }

    #[test]
    fn replacing_a_checkpoint_leaves_no_retired_copy() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("checkpoint-best");
        let retired = dir.path().join("checkpoint-best.old");
        fs::create_dir_all(&retired).unwrap();

        let weight = candle_core::Var::new(&[1.0f32, 2.0], &candle_core::Device::Cpu).unwrap();
        for step in [1, 2] {
            let hook = ModelSaveHook::Pretrained {
                parameters: vec![("weight".to_string(), weight.clone())],
                config: serde_json::Value::Null,
            };
            let mut state = TrainingState::new(step).with_model(hook);
            save_checkpoint(&mut state, &target).unwrap();
        }
        assert!(!retired.exists());
        assert_eq!(load_checkpoint(&target).unwrap().state.step, 2);
        assert_eq!(list_checkpoints(dir.path()).unwrap(), vec![target]);
    }

    #[test]
    fn prediction_needs_a_checkpoint_number() {
        let dir = tempfile::tempdir().unwrap();
        let err = select_for_prediction(dir.path(), 0).unwrap_err();
        assert!(matches!(err, TrainingError::Validation(_)));
        assert_eq!(
            select_checkpoints(dir.path(), 0, false).unwrap(),
            vec![dir.path().to_path_buf()]
        );
    }
}

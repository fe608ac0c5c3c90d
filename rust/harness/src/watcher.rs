//! Periodic scanner that turns experiment directories into records.
//!
//! The watcher owns its record table. After each scan that changed anything
//! it publishes an immutable snapshot on a watch channel; readers never see a
//! half-updated record.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use ailab_config::{LabConfig, WatcherSettings};
use chrono::{DateTime, Local};
use tokio::sync::watch;

use crate::{
    experiment::{
        EVENT_LOGS, ExperimentRecord, IMAGES_DIR, LogEvent, PROGRESS_FILE, SCALARS_DIR,
        is_experiment_dir, parse_progress, parse_scalar_line,
    },
    tail::TailReader,
};

/// Published snapshot of every known experiment, keyed by `project/name`.
pub type Records = Arc<BTreeMap<String, ExperimentRecord>>;

/// Scan state of one experiment directory.
#[derive(Debug)]
struct Tracked {
    record: ExperimentRecord,
    /// Size and mtime of the `progress` file at its last successful parse.
    progress_stamp: Option<(u64, SystemTime)>,
    readers: BTreeMap<PathBuf, TailReader>,
    /// Series fed by each scalar file, dropped when the file is truncated.
    series_by_file: BTreeMap<PathBuf, BTreeSet<String>>,
}

impl Tracked {
    fn new(record: ExperimentRecord) -> Self {
        Self {
            record,
            progress_stamp: None,
            readers: BTreeMap::new(),
            series_by_file: BTreeMap::new(),
        }
    }

    /// Bring the record up to date with the directory. Returns whether it
    /// changed.
    fn refresh(
        &mut self,
        settings: &WatcherSettings,
        stale_after: Duration,
        now: DateTime<Local>,
    ) -> bool {
        let before = self.record.clone();
        let dir = self.record.path.clone();

        let mut newest = mtime(&dir);
        if newest.is_some() {
            self.read_progress(&dir, &mut newest);
            self.read_scalars(&dir, settings.max_read_bytes, &mut newest);
            self.read_event_logs(&dir, settings.max_read_bytes, &mut newest);
            self.read_images(&dir, &mut newest);
        }

        if let Some(newest) = newest.map(DateTime::<Local>::from)
            && self.record.last_modified.is_none_or(|t| newest > t)
        {
            self.record.last_modified = Some(newest);
        }

        if self.record.primary.is_none() && self.record.scalars.contains_key(&settings.primary_metric)
        {
            self.record.primary = Some(settings.primary_metric.clone());
        }

        self.record.stale = self
            .record
            .last_modified
            .is_some_and(|t| (now - t).to_std().is_ok_and(|age| age > stale_after));

        self.record != before
    }

    fn read_progress(&mut self, dir: &Path, newest: &mut Option<SystemTime>) {
        let path = dir.join(PROGRESS_FILE);
        let Ok(meta) = fs::metadata(&path) else {
            return;
        };
        let Ok(modified) = meta.modified() else {
            return;
        };
        bump(newest, modified);

        let stamp = (meta.len(), modified);
        if self.progress_stamp == Some(stamp) {
            return;
        }

        match fs::read_to_string(&path).ok().as_deref().and_then(parse_progress) {
            Some(progress) => {
                self.record.progress = Some(progress);
                self.progress_stamp = Some(stamp);
            }
            None => {
                tracing::debug!(path = %path.display(), "progress file not parseable yet");
            }
        }
    }

    fn read_scalars(&mut self, dir: &Path, max_bytes: u64, newest: &mut Option<SystemTime>) {
        for path in list_files(&dir.join(SCALARS_DIR)) {
            if let Some(modified) = mtime(&path) {
                bump(newest, modified);
            }
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();

            let reader = self.readers.entry(path.clone()).or_default();
            let chunk = match reader.poll(&path, max_bytes) {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::debug!(path = %path.display(), "cannot read scalars: {e}");
                    continue;
                }
            };

            let series = self.series_by_file.entry(path.clone()).or_default();
            if chunk.reset {
                for name in std::mem::take(series) {
                    self.record.scalars.remove(&name);
                }
            }

            for line in &chunk.lines {
                match parse_scalar_line(line, &stem) {
                    Some((name, value)) => {
                        self.record.push_scalar(&name, value);
                        series.insert(name);
                    }
                    None => {
                        tracing::debug!(path = %path.display(), line = %line, "skipping malformed scalar line");
                    }
                }
            }
        }
    }

    fn read_event_logs(&mut self, dir: &Path, max_bytes: u64, newest: &mut Option<SystemTime>) {
        for name in EVENT_LOGS {
            let path = dir.join(name);
            let Some(modified) = mtime(&path) else {
                continue;
            };
            bump(newest, modified);

            let reader = self.readers.entry(path.clone()).or_default();
            let chunk = match reader.poll(&path, max_bytes) {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::debug!(path = %path.display(), "cannot read event log: {e}");
                    continue;
                }
            };

            for line in &chunk.lines {
                match serde_json::from_str::<LogEvent>(line) {
                    Ok(event) => event.apply(&mut self.record),
                    Err(e) => tracing::debug!(path = %path.display(), "skipping event line: {e}"),
                }
            }
        }
    }

    fn read_images(&mut self, dir: &Path, newest: &mut Option<SystemTime>) {
        let images_dir = dir.join(IMAGES_DIR);
        if let Some(modified) = mtime(&images_dir) {
            bump(newest, modified);
        }
        self.record.images = list_files(&images_dir)
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn bump(newest: &mut Option<SystemTime>, t: SystemTime) {
    if newest.is_none_or(|n| t > n) {
        *newest = Some(t);
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|n| n.to_string_lossy().starts_with('.'))
}

/// Non-hidden regular files in `dir`, sorted by name.
fn list_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
        .map(|e| e.path())
        .filter(|p| !is_hidden(p))
        .collect();
    files.sort();
    files
}

/// Collect experiment directories below `dir`. Experiments are not descended
/// into; symlinked directories are not followed.
fn find_experiments(dir: &Path, depth: usize, max_depth: usize, found: &mut Vec<PathBuf>) {
    if is_experiment_dir(dir) {
        found.push(dir.to_path_buf());
        return;
    }
    if depth >= max_depth {
        return;
    }
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    let mut children: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .map(|e| e.path())
        .filter(|p| !is_hidden(p))
        .collect();
    children.sort();
    for child in children {
        find_experiments(&child, depth + 1, max_depth, found);
    }
}

/// Scans every project's experiment tree.
#[derive(Debug)]
pub struct Watcher {
    /// Project name and experiment root.
    roots: Vec<(String, PathBuf)>,
    settings: WatcherSettings,
    interval: Duration,
    stale_after: Duration,
    auto_detect: bool,
    discovered: bool,
    experiments: BTreeMap<String, Tracked>,
}

impl Watcher {
    #[must_use]
    pub fn new(config: &LabConfig) -> Self {
        Self {
            roots: config.experiment_roots(),
            settings: config.watcher.clone(),
            interval: config.scan_interval(),
            stale_after: config.stale_after(),
            auto_detect: config.auto_detect_experiments,
            discovered: false,
            experiments: BTreeMap::new(),
        }
    }

    fn discover(&mut self) {
        for (project, root) in &self.roots {
            let mut found = Vec::new();
            find_experiments(root, 0, self.settings.max_depth, &mut found);

            for dir in found {
                let name = match dir.strip_prefix(root) {
                    Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
                    Ok(rel) => rel.to_string_lossy().into_owned(),
                    Err(_) => continue,
                };
                let key = format!("{project}/{name}");
                self.experiments.entry(key).or_insert_with(|| {
                    tracing::info!(%project, experiment = %name, "discovered experiment");
                    Tracked::new(ExperimentRecord::new(project.clone(), name, dir))
                });
            }
        }
        self.discovered = true;
    }

    /// Run one scan. Returns whether any record was added or changed.
    pub fn scan(&mut self, now: DateTime<Local>) -> bool {
        let mut changed = false;
        if self.auto_detect || !self.discovered {
            let known = self.experiments.len();
            self.discover();
            changed |= self.experiments.len() != known;
        }
        for tracked in self.experiments.values_mut() {
            changed |= tracked.refresh(&self.settings, self.stale_after, now);
        }
        changed
    }

    /// Copy of the current records.
    #[must_use]
    pub fn records(&self) -> BTreeMap<String, ExperimentRecord> {
        self.experiments
            .iter()
            .map(|(k, t)| (k.clone(), t.record.clone()))
            .collect()
    }

    /// Scan every interval on a blocking thread and publish changes.
    /// Returns when every receiver is gone.
    pub async fn run(self, publish: watch::Sender<Records>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut watcher = self;
        loop {
            interval.tick().await;
            let scanned = tokio::task::spawn_blocking(move || {
                let changed = watcher.scan(Local::now());
                (watcher, changed)
            })
            .await;

            let (scanned, changed) = match scanned {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("watcher scan aborted: {e}");
                    return;
                }
            };
            watcher = scanned;

            if changed {
                publish.send_replace(Arc::new(watcher.records()));
            }
            if publish.is_closed() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::{TempDir, tempdir};

    use super::*;

    fn setup(auto_detect: bool) -> (TempDir, Watcher) {
        let dir = tempdir().unwrap();
        let root = dir.path().join("mnist");
        fs::create_dir_all(&root).unwrap();
        let mut config = LabConfig::new([("mnist".to_string(), root)], vec![], dir.path());
        config.auto_detect_experiments = auto_detect;
        (dir, Watcher::new(&config))
    }

    fn append(path: &Path, text: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn test_progress_and_primary_scalar() {
        let (dir, mut watcher) = setup(false);
        let exp = dir.path().join("mnist/runs/a");
        append(&exp.join("progress"), "0.73");
        append(&exp.join("scalars/loss.csv"), "loss,0.1\nloss,0.042\n");
        append(&exp.join("scalars/acc.csv"), "0.9\n");

        assert!(watcher.scan(Local::now()));
        let records = watcher.records();
        let record = &records["mnist/runs/a"];
        assert_eq!(record.progress, Some(0.73));
        assert_eq!(record.primary.as_deref(), Some("loss"));
        assert_eq!(record.primary_value(), Some(0.042));
        assert_eq!(record.scalars["loss"].points, 2);
        assert_eq!(record.scalars["acc"].value, 0.9);
        assert!(!record.stale);

        // Nothing on disk changed, nothing in the record changes.
        assert!(!watcher.scan(Local::now()));
        assert_eq!(watcher.records(), records);
    }

    #[test]
    fn test_unterminated_line_completes_later() {
        let (dir, mut watcher) = setup(false);
        let file = dir.path().join("mnist/exp/scalars/loss.txt");
        append(&file, "0.5\n0.4");
        watcher.scan(Local::now());
        assert_eq!(watcher.records()["mnist/exp"].scalars["loss"].value, 0.5);

        append(&file, "2\n");
        watcher.scan(Local::now());
        let loss = watcher.records()["mnist/exp"].scalars["loss"];
        assert_eq!(loss.value, 0.42);
        assert_eq!(loss.points, 2);
    }

    #[test]
    fn test_truncated_scalar_file_resets_series() {
        let (dir, mut watcher) = setup(false);
        let file = dir.path().join("mnist/exp/scalars/loss.csv");
        append(&file, "0.9\n0.8\n0.7\n");
        watcher.scan(Local::now());

        fs::write(&file, "0.3\n").unwrap();
        watcher.scan(Local::now());
        let loss = watcher.records()["mnist/exp"].scalars["loss"];
        assert_eq!(loss.value, 0.3);
        assert_eq!(loss.points, 1);
    }

    #[test]
    fn test_half_written_progress_keeps_previous_value() {
        let (dir, mut watcher) = setup(false);
        let progress = dir.path().join("mnist/exp/progress");
        append(&progress, "0.5");
        watcher.scan(Local::now());

        fs::write(&progress, "").unwrap();
        watcher.scan(Local::now());
        assert_eq!(watcher.records()["mnist/exp"].progress, Some(0.5));

        fs::write(&progress, "done").unwrap();
        watcher.scan(Local::now());
        assert_eq!(watcher.records()["mnist/exp"].progress, Some(1.0));
    }

    #[test]
    fn test_event_log_and_images() {
        let (dir, mut watcher) = setup(false);
        let exp = dir.path().join("mnist/2019-01-01_mnist");
        append(
            &exp.join("log.txt"),
            concat!(
                r#"{"timestamp": "t", "eta": 30, "progress": 0.5}"#,
                "\n",
                r#"{"timestamp": "t", "name": "val_loss", "value": 1.5, "primary": true}"#,
                "\n",
                "not json\n",
            ),
        );
        append(&exp.join("images/b.png"), "");
        append(&exp.join("images/a.png"), "");
        append(&exp.join("images/.hidden.png"), "");

        watcher.scan(Local::now());
        let record = &watcher.records()["mnist/2019-01-01_mnist"];
        assert_eq!(record.progress, Some(0.5));
        assert_eq!(record.eta_secs, Some(30));
        assert_eq!(record.primary.as_deref(), Some("val_loss"));
        assert_eq!(record.images, vec!["a.png", "b.png"]);
    }

    #[test]
    fn test_discovery_rules() {
        let (dir, mut watcher) = setup(false);
        let root = dir.path().join("mnist");
        append(&root.join("a/b/c/d/e/progress"), "0.1");
        append(&root.join("deep/1/2/3/4/5/progress"), "0.1");
        append(&root.join(".hidden/exp/progress"), "0.1");
        append(&root.join("outer/progress"), "0.2");
        append(&root.join("outer/inner/progress"), "0.3");

        watcher.scan(Local::now());
        let keys: Vec<String> = watcher.records().into_keys().collect();
        assert_eq!(keys, vec!["mnist/a/b/c/d/e", "mnist/outer"]);
    }

    #[test]
    fn test_late_experiments_need_auto_detect() {
        let (dir, mut watcher) = setup(false);
        watcher.scan(Local::now());
        append(&dir.path().join("mnist/late/progress"), "0.1");
        assert!(!watcher.scan(Local::now()));
        assert!(watcher.records().is_empty());

        let (dir, mut watcher) = setup(true);
        watcher.scan(Local::now());
        append(&dir.path().join("mnist/late/progress"), "0.1");
        assert!(watcher.scan(Local::now()));
        assert_eq!(watcher.records().len(), 1);
    }

    #[test]
    fn test_results_tree_is_watched() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("mnist");
        let results = dir.path().join("results");
        fs::create_dir_all(&root).unwrap();
        let mut config = LabConfig::new([("mnist".to_string(), root.clone())], vec![], dir.path());
        config.results = Some(results.clone());
        append(&root.join("a/progress"), "0.1");
        append(&results.join("sweep/lr-3/progress"), "42%");

        let mut watcher = Watcher::new(&config);
        assert!(watcher.scan(Local::now()));
        let records = watcher.records();
        assert_eq!(records.len(), 2);
        let shared = &records["results/sweep/lr-3"];
        assert_eq!(shared.project, "results");
        assert_eq!(shared.progress, Some(0.42));
    }

    #[test]
    fn test_staleness_follows_configured_threshold() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("mnist");
        let mut config = LabConfig::new([("mnist".to_string(), root.clone())], vec![], dir.path());
        config.watcher.stale_after_secs = 30;
        let mut watcher = Watcher::new(&config);
        append(&root.join("a/progress"), "0.2");

        watcher.scan(Local::now() + chrono::Duration::seconds(10));
        assert!(!watcher.records()["mnist/a"].stale);
        assert!(watcher.scan(Local::now() + chrono::Duration::seconds(60)));
        assert!(watcher.records()["mnist/a"].stale);
    }

    #[test]
    fn test_stale_and_vanished() {
        let (dir, mut watcher) = setup(false);
        let exp = dir.path().join("mnist/old");
        append(&exp.join("progress"), "0.4");
        watcher.scan(Local::now());

        let later = Local::now() + chrono::Duration::hours(1);
        assert!(watcher.scan(later));
        assert!(watcher.records()["mnist/old"].stale);

        fs::remove_dir_all(&exp).unwrap();
        watcher.scan(later);
        let record = &watcher.records()["mnist/old"];
        assert_eq!(record.progress, Some(0.4));
        assert!(record.stale);
    }
}

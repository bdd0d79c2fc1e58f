// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Size-capped log file with timestamped backups, and the scheduler that rotates it.
//!
//! Writers and rotations take the same lock, so a line is always written whole to
//! either the old file or the new one. Backups are named
//! `<stem>-<UTC timestamp>[.<n>].<ext>` next to the active file.

use crate::constants::{MEGABYTE, ROTATION_TRIGGER_CAPACITY};
use crate::errors::RotationError;
use chrono::{DateTime, Duration as TimeDelta, NaiveDateTime, TimeZone, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const BACKUP_TIME_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.3f";
const BACKUP_TIME_LEN: usize = "2006-01-02T15-04-05.000".len();
const SECONDS_PER_DAY: i64 = 24 * 60 * 60;
// Larger ages are treated as this one; chrono durations overflow far beyond it.
const MAX_AGE_DAYS: i64 = 1_000_000;

/// Where the sink writes and what it retains. `0` disables a limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSinkConfig {
    pub path: PathBuf,
    pub max_size_mb: u64,
    pub max_backups: usize,
    pub max_age_days: u64,
}

impl FileSinkConfig {
    #[must_use]
    pub fn max_size_bytes(&self) -> Option<u64> {
        (self.max_size_mb > 0).then(|| self.max_size_mb.saturating_mul(MEGABYTE))
    }
}

struct Inner {
    file: Option<File>,
    size: u64,
    max_size: Option<u64>,
    // Set when the last open failed; cleared by the next successful open.
    failure: Option<String>,
}

pub struct RotatingFile {
    config: FileSinkConfig,
    inner: Mutex<Inner>,
    rotations: AtomicU64,
}

impl RotatingFile {
    /// Opens (appending) or creates the file, creating missing parent directories.
    pub fn open(config: FileSinkConfig) -> Result<Self, RotationError> {
        let file = open_append(&config.path)?;
        let size = file
            .metadata()
            .map_err(|e| RotationError::io(&config.path, e))?
            .len();
        let max_size = config.max_size_bytes();
        Ok(Self {
            config,
            inner: Mutex::new(Inner {
                file: Some(file),
                size,
                max_size,
                failure: None,
            }),
            rotations: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    #[must_use]
    pub fn config(&self) -> &FileSinkConfig {
        &self.config
    }

    /// Completed rotations since the sink was opened.
    #[must_use]
    pub fn rotations(&self) -> u64 {
        self.rotations.load(Ordering::SeqCst)
    }

    /// Caps the file at `bytes` instead of the configured megabytes.
    #[must_use]
    pub fn with_max_size_bytes(self, bytes: u64) -> Self {
        self.lock().max_size = (bytes > 0).then_some(bytes);
        self
    }

    /// Appends `line` and a trailing newline, rotating first if the write would push
    /// the file past its size limit.
    pub fn write_line(&self, line: &str) -> Result<(), RotationError> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        if !line.ends_with('\n') {
            bytes.push(b'\n');
        }
        let len = bytes.len() as u64;

        let mut inner = self.lock();
        if let Some(max) = inner.max_size {
            if len > max {
                return Err(RotationError::LineTooLarge { len, max });
            }
        }

        if inner.file.is_none() {
            self.reopen(&mut inner)?;
        }
        if inner.max_size.is_some_and(|max| inner.size + len > max) {
            self.rotate_locked(&mut inner, Utc::now())?;
        }

        let Some(file) = inner.file.as_mut() else {
            return Err(RotationError::SinkUnavailable(
                inner.failure.clone().unwrap_or_default(),
            ));
        };
        file.write_all(&bytes)
            .map_err(|e| RotationError::io(&self.config.path, e))?;
        inner.size += len;
        Ok(())
    }

    /// Closes the active file, moves it to a backup and starts a new file at the same
    /// path, then prunes backups beyond the retention limits.
    pub fn rotate(&self) -> Result<(), RotationError> {
        let mut inner = self.lock();
        self.rotate_locked(&mut inner, Utc::now())
    }

    /// Backups of this file, newest first.
    pub fn backups(&self) -> Result<Vec<PathBuf>, RotationError> {
        Ok(self
            .list_backups()?
            .into_iter()
            .map(|backup| backup.path)
            .collect())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A writer that panicked mid-write leaves nothing half-updated worth refusing.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rotate_locked(&self, inner: &mut Inner, now: DateTime<Utc>) -> Result<(), RotationError> {
        if let Some(mut file) = inner.file.take() {
            if let Err(e) = file.flush() {
                warn!("Failed to flush {} before rotation: {e}", self.path().display());
            }
        }

        match fs::rename(&self.config.path, self.backup_path(now)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} vanished before rotation", self.path().display());
            }
            Err(e) => {
                warn!("Failed to move {} aside: {e}", self.path().display());
                self.reopen(inner)?;
                return Err(RotationError::io(&self.config.path, e));
            }
        }

        self.reopen(inner)?;
        inner.size = 0;
        self.rotations.fetch_add(1, Ordering::SeqCst);

        if let Err(e) = self.prune(now) {
            warn!("Failed to prune backups of {}: {e}", self.path().display());
        }
        Ok(())
    }

    fn reopen(&self, inner: &mut Inner) -> Result<(), RotationError> {
        match open_append(&self.config.path) {
            Ok(file) => {
                inner.size = file.metadata().map(|m| m.len()).unwrap_or(0);
                inner.file = Some(file);
                if inner.failure.take().is_some() {
                    info!("Log file {} is writable again", self.path().display());
                }
                Ok(())
            }
            Err(e) => {
                error!("Log file sink unavailable: {e}");
                inner.failure = Some(e.to_string());
                Err(RotationError::SinkUnavailable(e.to_string()))
            }
        }
    }

    fn stem_and_extension(&self) -> (String, Option<String>) {
        let stem = self
            .config
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = self
            .config
            .path
            .extension()
            .map(|e| e.to_string_lossy().into_owned());
        (stem, extension)
    }

    fn backup_name(&self, timestamp: &str, sequence: u32) -> String {
        let (stem, extension) = self.stem_and_extension();
        let sequence = if sequence == 0 {
            String::new()
        } else {
            format!(".{sequence}")
        };
        match extension {
            Some(extension) => format!("{stem}-{timestamp}{sequence}.{extension}"),
            None => format!("{stem}-{timestamp}{sequence}"),
        }
    }

    // Same-millisecond backups continue after the highest surviving sequence, so a
    // newer backup never sorts below an older one.
    fn backup_path(&self, now: DateTime<Utc>) -> PathBuf {
        let timestamp = now.format(BACKUP_TIME_FORMAT).to_string();
        let directory = self.directory();
        let mut sequence = match NaiveDateTime::parse_from_str(&timestamp, BACKUP_TIME_FORMAT) {
            Ok(created) => self
                .list_backups()
                .unwrap_or_default()
                .iter()
                .filter(|backup| backup.created == created)
                .map(|backup| backup.sequence.saturating_add(1))
                .max()
                .unwrap_or(0),
            Err(_) => 0,
        };
        loop {
            let candidate = directory.join(self.backup_name(&timestamp, sequence));
            if !candidate.exists() {
                return candidate;
            }
            sequence += 1;
        }
    }

    fn directory(&self) -> PathBuf {
        match self.config.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn list_backups(&self) -> Result<Vec<Backup>, RotationError> {
        let directory = self.directory();
        let (stem, extension) = self.stem_and_extension();
        let prefix = format!("{stem}-");
        let suffix = extension.map(|e| format!(".{e}")).unwrap_or_default();

        let entries = fs::read_dir(&directory).map_err(|e| RotationError::io(&directory, e))?;
        let mut backups: Vec<Backup> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let rest = name.strip_prefix(&prefix)?.strip_suffix(&suffix)?;
                let (created, sequence) = parse_backup_suffix(rest)?;
                Some(Backup {
                    path: entry.path(),
                    created,
                    sequence,
                })
            })
            .collect();
        backups.sort_by(|a, b| (b.created, b.sequence).cmp(&(a.created, a.sequence)));
        Ok(backups)
    }

    fn prune(&self, now: DateTime<Utc>) -> Result<(), RotationError> {
        let backups = self.list_backups()?;
        let cutoff = (self.config.max_age_days > 0).then(|| {
            let days = i64::try_from(self.config.max_age_days).unwrap_or(MAX_AGE_DAYS);
            now.naive_utc() - TimeDelta::days(days.min(MAX_AGE_DAYS))
        });

        for (index, backup) in backups.iter().enumerate() {
            let over_count = self.config.max_backups > 0 && index >= self.config.max_backups;
            let too_old = cutoff.is_some_and(|cutoff| backup.created < cutoff);
            if over_count || too_old {
                debug!("Removing old log backup {}", backup.path.display());
                fs::remove_file(&backup.path).map_err(|e| RotationError::io(&backup.path, e))?;
            }
        }
        Ok(())
    }
}

struct Backup {
    path: PathBuf,
    created: NaiveDateTime,
    sequence: u32,
}

fn parse_backup_suffix(rest: &str) -> Option<(NaiveDateTime, u32)> {
    let timestamp = rest.get(..BACKUP_TIME_LEN)?;
    let created = NaiveDateTime::parse_from_str(timestamp, BACKUP_TIME_FORMAT).ok()?;
    let sequence = match &rest[BACKUP_TIME_LEN..] {
        "" => 0,
        tail => tail.strip_prefix('.')?.parse().ok()?,
    };
    Some((created, sequence))
}

fn open_append(path: &Path) -> Result<File, RotationError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| RotationError::io(parent, e))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| RotationError::io(path, e))
}

/// What asked for a rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationTrigger {
    /// The local-midnight timer fired.
    Daily,
    /// The process received SIGHUP.
    Signal,
    /// [`RotationScheduler::trigger`] was called.
    Manual,
}

/// Which trigger sources [`RotationScheduler::spawn_with`] starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerSources {
    pub daily: bool,
    pub hangup: bool,
}

impl Default for TriggerSources {
    fn default() -> Self {
        Self {
            daily: true,
            hangup: true,
        }
    }
}

/// Rotates a [`RotatingFile`] at local midnight, on SIGHUP and on demand.
///
/// Every trigger is queued to a single rotation task, so rotations never overlap and
/// two triggers in quick succession produce two rotations.
pub struct RotationScheduler {
    triggers: mpsc::Sender<RotationTrigger>,
    cancel: CancellationToken,
    rotator: JoinHandle<()>,
    sources: Vec<JoinHandle<()>>,
    completed: Arc<AtomicU64>,
}

impl RotationScheduler {
    pub fn spawn(sink: Arc<RotatingFile>, cancel: CancellationToken) -> Self {
        Self::spawn_with(sink, cancel, TriggerSources::default())
    }

    pub fn spawn_with(
        sink: Arc<RotatingFile>,
        cancel: CancellationToken,
        sources: TriggerSources,
    ) -> Self {
        let (triggers, receiver) = mpsc::channel(ROTATION_TRIGGER_CAPACITY);
        let completed = Arc::new(AtomicU64::new(0));
        let rotator = tokio::spawn(run_rotations(sink, receiver, Arc::clone(&completed)));

        let mut tasks = Vec::new();
        if sources.daily {
            tasks.push(tokio::spawn(run_daily(triggers.clone(), cancel.clone())));
        }
        if sources.hangup {
            tasks.push(tokio::spawn(run_hangup(triggers.clone(), cancel.clone())));
        }

        Self {
            triggers,
            cancel,
            rotator,
            sources: tasks,
            completed,
        }
    }

    /// Queues a rotation. Resolves once the trigger is queued, not once it has run.
    pub async fn trigger(&self) -> Result<(), RotationError> {
        self.triggers
            .send(RotationTrigger::Manual)
            .await
            .map_err(|_| RotationError::SchedulerStopped)
    }

    /// Rotations that completed successfully.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Stops the trigger sources, runs every rotation already queued and waits for all
    /// tasks to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        for source in self.sources {
            if let Err(e) = source.await {
                error!("Rotation trigger task failed: {e}");
            }
        }
        drop(self.triggers);
        if let Err(e) = self.rotator.await {
            error!("Rotation task failed: {e}");
        }
    }
}

async fn run_rotations(
    sink: Arc<RotatingFile>,
    mut triggers: mpsc::Receiver<RotationTrigger>,
    completed: Arc<AtomicU64>,
) {
    while let Some(trigger) = triggers.recv().await {
        info!("Rotating {} ({trigger:?})", sink.path().display());
        let rotating = Arc::clone(&sink);
        match tokio::task::spawn_blocking(move || rotating.rotate()).await {
            Ok(Ok(())) => {
                completed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Err(e)) => error!("Log file rotation failed: {e}"),
            Err(e) => error!("Log file rotation aborted: {e}"),
        }
    }
    debug!("Rotation task stopped");
}

async fn run_daily(triggers: mpsc::Sender<RotationTrigger>, cancel: CancellationToken) {
    loop {
        let wait = until_next_midnight(chrono::Local::now());
        debug!("Next scheduled rotation in {}s", wait.as_secs());
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(wait) => {
                if triggers.send(RotationTrigger::Daily).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(unix)]
async fn run_hangup(triggers: mpsc::Sender<RotationTrigger>, cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            error!("Failed to listen for SIGHUP, rotation on signal disabled: {e}");
            return;
        }
    };
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            received = hangup.recv() => {
                if received.is_none() {
                    break;
                }
                info!("Received SIGHUP");
                if triggers.send(RotationTrigger::Signal).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn run_hangup(_triggers: mpsc::Sender<RotationTrigger>, _cancel: CancellationToken) {
    debug!("SIGHUP rotation is not available on this platform");
}

/// Time from `now` until the next midnight in `now`'s time zone.
pub fn until_next_midnight<Tz: TimeZone>(now: DateTime<Tz>) -> Duration {
    let fallback = Duration::from_secs(SECONDS_PER_DAY.unsigned_abs());
    let Some(midnight) = now
        .date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
    else {
        return fallback;
    };

    let delta = match now.timezone().from_local_datetime(&midnight).earliest() {
        Some(next) => next.naive_utc() - now.naive_utc(),
        // Midnight does not exist locally on a DST jump day.
        None => midnight - now.naive_local(),
    };
    delta.to_std().unwrap_or(fallback)
}

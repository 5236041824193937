//! Change detection for the identity files inside one directory.
//!
//! The primary strategy registers an OS file-change notifier on the parent
//! directory; when the notifier cannot be constructed (network filesystems,
//! configmap mounts with unreliable events) the watcher silently falls back to
//! stat-based polling. Exactly one strategy runs per watcher, so a single
//! change is never debounced twice.
//!
//! Rotation rewrites the certificate, key, and CA in quick succession. Every
//! detected change resets a debounce timer; the callback fires once per burst,
//! after the directory has been quiet for the debounce interval.

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Quiescence period between the last detected change and the reload callback.
/// Must exceed the window during which the identity agent rewrites the three
/// files separately.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Stat period for the polling fallback.
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(10);

pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
	#[error("watcher requires a tokio runtime: {0}")]
	Runtime(String),
}

/// Watches a fixed set of file names inside one directory and invokes a
/// debounced callback when any of them changes.
pub struct FileWatcher {
	dir: PathBuf,
	files: Vec<OsString>,
	interval: Duration,
	debounce: Duration,
	callback: ChangeCallback,
	force_polling: bool,
	running: Arc<AtomicBool>,
	inner: Mutex<Option<Running>>,
}

struct Running {
	task: tokio::task::JoinHandle<()>,
	// Keeps the OS notifier registered for the lifetime of the event task.
	_notifier: Option<RecommendedWatcher>,
}

enum Strategy {
	Events(mpsc::UnboundedReceiver<()>),
	Poll(Duration),
}

impl FileWatcher {
	pub fn new(
		dir: PathBuf,
		files: Vec<OsString>,
		interval: Duration,
		debounce: Duration,
		callback: ChangeCallback,
	) -> FileWatcher {
		FileWatcher {
			dir,
			files,
			interval,
			debounce,
			callback,
			force_polling: false,
			running: Arc::new(AtomicBool::new(false)),
			inner: Mutex::new(None),
		}
	}

	/// Skip the OS notifier and go straight to polling.
	#[cfg(test)]
	pub(crate) fn polling_only(mut self) -> FileWatcher {
		self.force_polling = true;
		self
	}

	/// Begin watching. Idempotent: a second call while running is a no-op.
	pub fn start(&self) -> Result<(), Error> {
		let handle = tokio::runtime::Handle::try_current()
			.map_err(|e| Error::Runtime(e.to_string()))?;

		let mut inner = self.inner.lock();
		if inner.is_some() {
			return Ok(());
		}

		let (strategy, notifier) = if self.force_polling {
			(Strategy::Poll(self.interval), None)
		} else {
			match self.try_notifier() {
				Ok((notifier, rx)) => {
					debug!(dir = %self.dir.display(), "watching via OS change notifications");
					(Strategy::Events(rx), Some(notifier))
				},
				Err(e) => {
					warn!(
						dir = %self.dir.display(),
						"file notifications unavailable ({e}), falling back to polling every {:?}",
						self.interval
					);
					(Strategy::Poll(self.interval), None)
				},
			}
		};

		self.running.store(true, Ordering::SeqCst);
		let task = handle.spawn(run(
			self.dir.clone(),
			self.files.clone(),
			strategy,
			self.debounce,
			self.callback.clone(),
			self.running.clone(),
		));
		*inner = Some(Running {
			task,
			_notifier: notifier,
		});
		Ok(())
	}

	/// Stop watching and cancel any pending debounce timer. A callback already
	/// in flight is allowed to complete. Idempotent.
	pub fn stop(&self) {
		let mut inner = self.inner.lock();
		self.running.store(false, Ordering::SeqCst);
		if let Some(running) = inner.take() {
			running.task.abort();
		}
	}

	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::SeqCst)
	}

	fn try_notifier(
		&self,
	) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<()>), notify::Error> {
		let (tx, rx) = mpsc::unbounded_channel();
		let tracked: HashSet<OsString> = self.files.iter().cloned().collect();
		let mut notifier =
			notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
				let Ok(event) = res else { return };
				// Only writes and creates count. Rotation may delete and
				// recreate a file; the delete alone must not trigger a
				// reload, and neither must metadata-only changes.
				let relevant_kind = match event.kind {
					EventKind::Create(_) => true,
					EventKind::Modify(ModifyKind::Metadata(_)) => false,
					EventKind::Modify(_) => true,
					_ => false,
				};
				if !relevant_kind {
					return;
				}
				let relevant = event.paths.iter().any(|p| {
					p.file_name()
						.map(|name| tracked.contains(name))
						.unwrap_or(false)
				});
				if relevant {
					let _ = tx.send(());
				}
			})?;
		notifier.watch(&self.dir, RecursiveMode::NonRecursive)?;
		Ok((notifier, rx))
	}
}

impl Drop for FileWatcher {
	fn drop(&mut self) {
		self.stop();
	}
}

async fn run(
	dir: PathBuf,
	files: Vec<OsString>,
	strategy: Strategy,
	debounce: Duration,
	callback: ChangeCallback,
	running: Arc<AtomicBool>,
) {
	let mut deadline: Option<Instant> = None;
	match strategy {
		Strategy::Events(mut rx) => loop {
			tokio::select! {
				event = rx.recv() => match event {
					Some(()) => {
						debug!(dir = %dir.display(), "change detected, debouncing");
						deadline = Some(Instant::now() + debounce);
					},
					// Notifier dropped; the watcher is stopping.
					None => break,
				},
				_ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
					deadline = None;
					fire(&callback, &running);
				},
			}
		},
		Strategy::Poll(every) => {
			let mut mtimes: HashMap<OsString, SystemTime> = HashMap::new();
			// Prime the mtime map so pre-existing files do not count as a
			// change on the first tick.
			poll_once(&dir, &files, &mut mtimes);
			let mut ticker = tokio::time::interval(every);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			ticker.reset();
			loop {
				tokio::select! {
					_ = ticker.tick() => {
						if poll_once(&dir, &files, &mut mtimes) {
							debug!(dir = %dir.display(), "change detected by poll, debouncing");
							deadline = Some(Instant::now() + debounce);
						}
					},
					_ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
						deadline = None;
						fire(&callback, &running);
					},
				}
			}
		},
	}
}

fn fire(callback: &ChangeCallback, running: &Arc<AtomicBool>) {
	// stop() may have raced the timer; a stopped watcher must not call back.
	if !running.load(Ordering::SeqCst) {
		return;
	}
	let callback = callback.clone();
	tokio::task::spawn_blocking(move || callback());
}

/// Stat every tracked file and remember its mtime. Returns whether any file
/// changed since the previous observation. A missing file is neither a change
/// nor an error: rotation may remove it briefly, and it reappearing with a
/// fresh mtime is what counts.
fn poll_once(
	dir: &Path,
	files: &[OsString],
	mtimes: &mut HashMap<OsString, SystemTime>,
) -> bool {
	let mut changed = false;
	for file in files {
		let Ok(meta) = std::fs::metadata(dir.join(file)) else {
			continue;
		};
		let Ok(modified) = meta.modified() else {
			continue;
		};
		match mtimes.get(file) {
			Some(prev) if modified <= *prev => {},
			_ => changed = true,
		}
		mtimes.insert(file.clone(), modified);
	}
	changed
}

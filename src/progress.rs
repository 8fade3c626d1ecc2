//! Progress and status aggregation for DIMSE operations.
//!
//! A [`Progress`] is shared between the code that drives an operation and the code that observes
//! it. It collects matches and sub-operation outcomes, merges them with the counters reported by
//! the peer and produces the final [`Status`]. It also carries the cancellation flag that the
//! dispatcher checks after every pending response.

use crate::dimse::{status, StatusType};
use crate::types::{UI, US};
use dicom::object::InMemDicomObject;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, warn};

/// Number of occurrences of the same status code that are logged individually.
const LOGGED_OCCURRENCES: usize = 3;

/// Sub-operation counters as reported in C-GET and C-MOVE responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubOperationCounters {
	pub remaining: u32,
	pub completed: u32,
	pub failed: u32,
	pub warning: u32,
}

impl SubOperationCounters {
	/// Element-wise maximum, so that counters never decrease.
	#[must_use]
	pub fn merge(self, other: Self) -> Self {
		Self {
			remaining: other.remaining,
			completed: self.completed.max(other.completed),
			failed: self.failed.max(other.failed),
			warning: self.warning.max(other.warning),
		}
	}

	pub const fn total(&self) -> u32 {
		self.completed + self.failed + self.warning
	}
}

/// Outcome of a single sub-operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubOperationRecord {
	pub sop_instance_uid: Option<UI>,
	pub status: US,
	pub bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Timings {
	pub connect: Duration,
	pub transfer: Duration,
	pub total: Duration,
}

/// The final result of an operation.
#[derive(Debug, Clone)]
pub struct Status {
	/// The worst status code observed.
	pub code: US,
	pub message: String,
	pub matches: Vec<InMemDicomObject>,
	pub records: Vec<SubOperationRecord>,
	pub counters: SubOperationCounters,
	pub bytes: u64,
	pub timings: Timings,
	pub cancelled: bool,
}

impl Status {
	/// The classification of the operation. Any failed sub-operation makes the operation a
	/// failure, even if the peer reported a warning.
	pub fn status_type(&self) -> StatusType {
		if self.counters.failed > 0 {
			return StatusType::Failure;
		}
		match StatusType::classify(self.code) {
			StatusType::Pending => StatusType::Success,
			other => other,
		}
	}

	pub fn is_success(&self) -> bool {
		self.status_type() == StatusType::Success
	}

	/// True if some but not all sub-operations failed.
	pub const fn is_partial(&self) -> bool {
		self.counters.failed > 0 && self.counters.completed + self.counters.warning > 0
	}
}

/// A point-in-time view for observers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
	pub counters: SubOperationCounters,
	pub matches: usize,
	pub bytes: u64,
	pub last_status: Option<US>,
}

#[derive(Debug, Default)]
struct Aggregate {
	local: SubOperationCounters,
	reported: SubOperationCounters,
	worst: Option<US>,
	matches: Vec<InMemDicomObject>,
	match_count: usize,
	records: Vec<SubOperationRecord>,
	bytes: u64,
	occurrences: HashMap<US, usize>,
	errors: Vec<String>,
	error_comment: Option<String>,
	connect: Option<Duration>,
	transfer_started: Option<Instant>,
}

impl Aggregate {
	fn observe(&mut self, code: US) {
		let severity = StatusType::classify(code).severity();
		let worse = self
			.worst
			.is_none_or(|worst| severity > StatusType::classify(worst).severity());
		if worse {
			self.worst = Some(code);
		}
	}

	fn counters(&self) -> SubOperationCounters {
		let mut counters = self.reported.merge(self.local);
		counters.remaining = self.reported.remaining;
		counters
	}
}

struct Inner {
	cancelled: AtomicBool,
	keep_matches: bool,
	started: Instant,
	aggregate: Mutex<Aggregate>,
	snapshot: watch::Sender<ProgressSnapshot>,
}

#[derive(Clone)]
pub struct Progress {
	inner: Arc<Inner>,
}

impl Default for Progress {
	fn default() -> Self {
		Self::new()
	}
}

impl Progress {
	pub fn new() -> Self {
		Self::with_matches(true)
	}

	/// Creates an aggregator that only counts matches instead of keeping them.
	pub fn counting() -> Self {
		Self::with_matches(false)
	}

	fn with_matches(keep_matches: bool) -> Self {
		Self {
			inner: Arc::new(Inner {
				cancelled: AtomicBool::new(false),
				keep_matches,
				started: Instant::now(),
				aggregate: Mutex::new(Aggregate::default()),
				snapshot: watch::Sender::new(ProgressSnapshot::default()),
			}),
		}
	}

	/// Requests cancellation of the running operation.
	pub fn cancel(&self) {
		self.inner.cancelled.store(true, Ordering::SeqCst);
	}

	pub fn cancel_requested(&self) -> bool {
		self.inner.cancelled.load(Ordering::SeqCst)
	}

	pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
		self.inner.snapshot.subscribe()
	}

	pub fn snapshot(&self) -> ProgressSnapshot {
		self.inner.snapshot.borrow().clone()
	}

	/// Records the time it took to establish the association.
	pub fn connected(&self, elapsed: Duration) {
		self.update(|aggregate| {
			aggregate.connect = Some(elapsed);
			aggregate.transfer_started = Some(Instant::now());
		});
	}

	/// Records the outcome of a sub-operation and returns its classification.
	/// Success, warning and failure are counted locally. Repeated warnings and failures with
	/// the same status code are only logged a few times.
	pub fn on_sub_operation(&self, sop_instance_uid: Option<&str>, code: US, bytes: u64) -> StatusType {
		let status_type = match StatusType::classify(code) {
			StatusType::Success => StatusType::Success,
			StatusType::Warning => StatusType::Warning,
			_ => StatusType::Failure,
		};

		self.update(|aggregate| {
			match status_type {
				StatusType::Success => aggregate.local.completed += 1,
				StatusType::Warning => aggregate.local.warning += 1,
				_ => aggregate.local.failed += 1,
			}
			aggregate.observe(code);
			aggregate.bytes += bytes;
			aggregate.records.push(SubOperationRecord {
				sop_instance_uid: sop_instance_uid.map(UI::from),
				status: code,
				bytes,
			});

			if status_type != StatusType::Success {
				let occurrences = aggregate.occurrences.entry(code).or_default();
				*occurrences += 1;
				match (*occurrences, status_type) {
					(n, StatusType::Warning) if n <= LOGGED_OCCURRENCES => {
						warn!(sop_instance_uid, status = code, "Sub-operation completed with warning");
					}
					(n, _) if n <= LOGGED_OCCURRENCES => {
						error!(sop_instance_uid, status = code, "Sub-operation failed");
					}
					(n, _) if n == LOGGED_OCCURRENCES + 1 => {
						warn!(
							status = code,
							"Further sub-operations with status {code:#06x} are not logged"
						);
					}
					_ => {}
				}
			}
		});

		status_type
	}

	/// Merges counters reported by the peer. Counters never decrease.
	pub fn on_counters(&self, counters: SubOperationCounters) {
		self.update(|aggregate| {
			aggregate.reported = aggregate.reported.merge(counters);
		});
	}

	/// Records a C-FIND match.
	pub fn on_match(&self, identifier: &InMemDicomObject) {
		let keep = self.inner.keep_matches;
		self.update(|aggregate| {
			aggregate.match_count += 1;
			if keep {
				aggregate.matches.push(identifier.clone());
			}
		});
	}

	/// Records the status of the final response.
	pub fn on_final(&self, code: US, error_comment: Option<String>) {
		self.update(|aggregate| {
			aggregate.observe(code);
			if error_comment.is_some() {
				aggregate.error_comment = error_comment;
			}
		});
	}

	/// Records an error that ended the operation early, e.g. a lost association.
	pub fn on_error(&self, message: impl Into<String>) {
		let message = message.into();
		self.update(|aggregate| {
			aggregate.observe(status::PROCESSING_FAILURE);
			aggregate.errors.push(message);
		});
	}

	/// The merged counters observed so far.
	pub fn counters(&self) -> SubOperationCounters {
		self.snapshot().counters
	}

	/// Produces the final status.
	pub fn finalize(&self) -> Status {
		let cancelled = self.cancel_requested();
		let aggregate = self
			.inner
			.aggregate
			.lock()
			.unwrap_or_else(std::sync::PoisonError::into_inner);

		let counters = aggregate.counters();
		let code = aggregate.worst.unwrap_or(status::SUCCESS);
		let transfer = aggregate
			.transfer_started
			.map(|started| started.elapsed())
			.unwrap_or_default();

		let message = if let Some(error) = aggregate.errors.last() {
			error.clone()
		} else if let Some(comment) = &aggregate.error_comment {
			comment.clone()
		} else {
			describe(code, counters, cancelled)
		};

		Status {
			code,
			message,
			matches: aggregate.matches.clone(),
			records: aggregate.records.clone(),
			counters,
			bytes: aggregate.bytes,
			timings: Timings {
				connect: aggregate.connect.unwrap_or_default(),
				transfer,
				total: self.inner.started.elapsed(),
			},
			cancelled: cancelled || StatusType::classify(code) == StatusType::Cancel,
		}
	}

	fn update(&self, f: impl FnOnce(&mut Aggregate)) {
		let mut aggregate = self
			.inner
			.aggregate
			.lock()
			.unwrap_or_else(std::sync::PoisonError::into_inner);
		f(&mut aggregate);
		let snapshot = ProgressSnapshot {
			counters: aggregate.counters(),
			matches: aggregate.match_count,
			bytes: aggregate.bytes,
			last_status: aggregate.records.last().map(|record| record.status),
		};
		drop(aggregate);
		self.inner.snapshot.send_replace(snapshot);
	}
}

fn describe(code: US, counters: SubOperationCounters, cancelled: bool) -> String {
	if cancelled || StatusType::classify(code) == StatusType::Cancel {
		return String::from("Cancelled");
	}
	if counters.failed > 0 {
		return format!(
			"{} of {} sub-operations failed",
			counters.failed,
			counters.total()
		);
	}
	match StatusType::classify(code) {
		StatusType::Warning if counters.warning > 0 => {
			format!("Completed with {} warnings", counters.warning)
		}
		StatusType::Warning => format!("Completed with warning {code:#06x}"),
		StatusType::Failure => format!("Failed with status {code:#06x}"),
		_ => String::from("Success"),
	}
}

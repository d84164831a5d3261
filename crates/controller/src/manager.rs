use crate::backoff::ExponentialBackoff;
use crate::classifier::ErrorClassifier;
use crate::oracle::{self, TimeOracle};
use crate::queue::AdminJobQueue;
use crate::state::ChangefeedState;
use crate::window::StateWindow;
use chrono::{DateTime, TimeDelta, Utc};
use model::{
    AdminJob, AdminJobType, CaptureId, ChangefeedId, ChangefeedStatus, FeedState, RunningError,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Samples of feed state retained for stability detection.
const STATE_WINDOW_SIZE: usize = 512;

/// Restart backoff tuning. A faulted feed first waits the initial interval,
/// doubling (with jitter) up to the max interval; once it has been failing
/// for the whole elapsed budget it is failed for good.
const INITIAL_BACKOFF_INTERVAL: Duration = Duration::from_secs(10);
const MAX_BACKOFF_INTERVAL: Duration = Duration::from_secs(30 * 60);
const BACKOFF_MULTIPLIER: f64 = 2.0;
const BACKOFF_RANDOMIZATION: f64 = 0.1;
const MAX_BACKOFF_ELAPSED: Duration = Duration::from_secs(90 * 60);

/// The per-changefeed decision engine of the controller.
///
/// Once per reconciliation round the owning loop calls [`tick`], which
/// reconciles operator commands, processor fault reports, and the persisted
/// feed state into patch intents on the supplied [`ChangefeedState`] and
/// into the `should_running` / `should_removed` flags. All mutation of
/// persisted data flows through the patch journal; the manager itself holds
/// only in-memory bookkeeping and performs no I/O beyond the bounded epoch
/// fetch.
///
/// [`tick`]: ChangefeedStateManager::tick
pub struct ChangefeedStateManager {
    id: ChangefeedId,
    oracle: Arc<dyn TimeOracle>,
    classifier: Arc<dyn ErrorClassifier>,
    admin_jobs: AdminJobQueue,
    state_window: StateWindow,
    backoff: ExponentialBackoff,
    /// Delay the restart gate currently enforces.
    backoff_interval: Duration,
    /// When the first error of the current failure episode arrived.
    /// `None` while no fault is pending.
    last_error_time: Option<DateTime<Utc>>,
    should_running: bool,
    should_removed: bool,
    /// Set by the first tick; `mark_finished` is a no-op before that.
    ticked: bool,
}

impl ChangefeedStateManager {
    pub fn new(
        id: ChangefeedId,
        oracle: Arc<dyn TimeOracle>,
        classifier: Arc<dyn ErrorClassifier>,
    ) -> Self {
        let now = oracle.current_time();
        let mut backoff = ExponentialBackoff::new(INITIAL_BACKOFF_INTERVAL, MAX_BACKOFF_INTERVAL)
            .with_multiplier(BACKOFF_MULTIPLIER)
            .with_randomization(BACKOFF_RANDOMIZATION)
            .with_max_elapsed(MAX_BACKOFF_ELAPSED);
        backoff.reset(now);
        let backoff_interval = backoff.next(now).unwrap_or(INITIAL_BACKOFF_INTERVAL);

        Self {
            id,
            oracle,
            classifier,
            admin_jobs: AdminJobQueue::new(),
            state_window: StateWindow::new(STATE_WINDOW_SIZE),
            backoff,
            backoff_interval,
            last_error_time: None,
            should_running: true,
            should_removed: false,
            ticked: false,
        }
    }

    /// Whether the changefeed should currently be running.
    pub fn should_running(&self) -> bool {
        self.should_running
    }

    /// Whether the changefeed should be torn down and its records erased.
    pub fn should_removed(&self) -> bool {
        self.should_removed
    }

    /// Enqueue an operator command. Fails on kinds operators may not issue.
    pub fn push_admin_job(&self, job: AdminJob) -> anyhow::Result<()> {
        self.admin_jobs.push(job)
    }

    /// Cloneable handle for enqueueing admin jobs from other threads.
    pub fn admin_jobs(&self) -> AdminJobQueue {
        self.admin_jobs.clone()
    }

    /// Request that the feed be finalized on an upcoming tick, once its
    /// sinks have reported completion. A no-op until the first tick has run;
    /// repeated calls queue at most one finish job.
    pub fn mark_finished(&self) {
        if !self.ticked {
            return;
        }
        self.admin_jobs.push_finish(AdminJob {
            id: self.id.clone(),
            kind: AdminJobType::Finish,
            overwrite_checkpoint_ts: None,
        });
    }

    /// Run one decision round. Returns true iff an admin job was consumed,
    /// in which case everything else waits for the next tick so persistence
    /// converges on the command's outcome first.
    #[tracing::instrument(skip_all, fields(namespace = %self.id.namespace, changefeed = %self.id.id))]
    pub async fn tick(&mut self, state: &mut ChangefeedState) -> bool {
        self.ticked = true;
        self.should_running = true;

        let admin_job_pending = self.handle_admin_job(state).await;
        if !admin_job_pending {
            self.evaluate(state).await;
        }

        if self.should_running {
            self.patch_state(state, FeedState::Normal).await;
        } else {
            self.clean_up_task_positions(state);
        }
        admin_job_pending
    }

    async fn evaluate(&mut self, state: &mut ChangefeedState) {
        let Some(feed_state) = state.info.as_ref().map(|info| info.state) else {
            // Transient gap between removal and teardown; nothing to manage.
            self.should_running = false;
            return;
        };

        match feed_state {
            FeedState::Removed => {
                self.should_running = false;
                self.should_removed = true;
                return;
            }
            FeedState::Stopped | FeedState::Failed | FeedState::Finished => {
                self.should_running = false;
                return;
            }
            FeedState::Error => {
                let unretryable = state
                    .info
                    .as_ref()
                    .and_then(|info| info.error.as_ref())
                    .map_or(false, |error| self.classifier.is_unretryable(&error.code));
                if unretryable {
                    self.should_running = false;
                    self.patch_state(state, FeedState::Failed).await;
                    return;
                }
            }
            FeedState::Normal | FeedState::Warning => {}
        }

        let errors = self.errors_reported_by_processors(state);
        self.handle_errors(state, &errors).await;
        let warnings = self.warnings_reported_by_processors(state);
        self.handle_warnings(state, &warnings);
    }

    /// Dequeue and act on at most one admin job. Returns true iff a job was
    /// accepted; rejected or misaddressed jobs are consumed without effect.
    async fn handle_admin_job(&mut self, state: &mut ChangefeedState) -> bool {
        let Some(job) = self.admin_jobs.pop() else {
            return false;
        };
        if job.id != self.id {
            // The queue is per-manager but persistence patches are by id.
            return false;
        }
        let Some(feed_state) = state.info.as_ref().map(|info| info.state) else {
            return false;
        };

        match job.kind {
            AdminJobType::Stop => match feed_state {
                FeedState::Normal | FeedState::Error => {
                    tracing::info!("stopping changefeed");
                    self.should_running = false;
                    self.patch_state(state, FeedState::Stopped).await;
                    true
                }
                _ => {
                    tracing::warn!(state = %feed_state, "cannot stop the changefeed in its current state");
                    false
                }
            },
            AdminJobType::Resume => match feed_state {
                FeedState::Failed | FeedState::Error | FeedState::Stopped | FeedState::Finished => {
                    tracing::info!(
                        overwrite_checkpoint_ts = ?job.overwrite_checkpoint_ts,
                        "resuming changefeed",
                    );
                    self.should_running = true;
                    let now = self.oracle.current_time();
                    self.reset_backoff(now);
                    self.last_error_time = None;
                    self.patch_state(state, FeedState::Normal).await;

                    let overwrite = job.overwrite_checkpoint_ts;
                    state.patch_info(move |info| {
                        let Some(mut info) = info else {
                            return Ok((None, false));
                        };
                        let mut changed = info.error.take().is_some();
                        if let Some(start_ts) = overwrite {
                            changed = changed || info.start_ts != start_ts;
                            info.start_ts = start_ts;
                        }
                        Ok((Some(info), changed))
                    });
                    if let Some(start_ts) = overwrite {
                        // The feed restarts from the rewound offset, so all
                        // progress timestamps restart from it as well.
                        state.patch_status(move |_| {
                            Ok((
                                Some(ChangefeedStatus {
                                    checkpoint_ts: start_ts,
                                    resolved_ts: start_ts,
                                    min_table_barrier_ts: start_ts,
                                    admin_job_type: AdminJobType::None,
                                }),
                                true,
                            ))
                        });
                    }
                    true
                }
                _ => {
                    tracing::warn!(state = %feed_state, "cannot resume the changefeed in its current state");
                    false
                }
            },
            AdminJobType::Remove => {
                let checkpoint_ts = state.status.as_ref().map(|status| status.checkpoint_ts);
                tracing::info!(?checkpoint_ts, "removing changefeed");
                self.should_running = false;
                self.should_removed = true;
                state.patch_info(|info| Ok((None, info.is_some())));
                state.patch_status(|status| Ok((None, status.is_some())));
                true
            }
            AdminJobType::Finish => match feed_state {
                FeedState::Normal => {
                    tracing::info!("finishing changefeed");
                    self.should_running = false;
                    self.patch_state(state, FeedState::Finished).await;
                    true
                }
                _ => {
                    tracing::warn!(state = %feed_state, "cannot finish the changefeed in its current state");
                    false
                }
            },
            AdminJobType::None => {
                tracing::warn!("ignoring admin job without a kind");
                false
            }
        }
    }

    /// Drain error reports from task positions, coalescing by error code.
    fn errors_reported_by_processors(&self, state: &mut ChangefeedState) -> Vec<RunningError> {
        let reporting: Vec<(CaptureId, RunningError)> = state
            .task_positions
            .iter()
            .filter_map(|(capture, position)| {
                position.error.clone().map(|error| (capture.clone(), error))
            })
            .collect();

        let mut collected = BTreeMap::new();
        for (capture, error) in reporting {
            tracing::error!(capture = %capture, error = %error, "processor reported an error");
            collected.insert(error.code.clone(), error);
            state.patch_task_position(&capture, |position| {
                let Some(mut position) = position else {
                    return Ok((None, false));
                };
                let changed = position.error.take().is_some();
                Ok((Some(position), changed))
            });
        }
        collected.into_values().collect()
    }

    /// Drain warning reports from task positions, coalescing by code.
    fn warnings_reported_by_processors(&self, state: &mut ChangefeedState) -> Vec<RunningError> {
        let reporting: Vec<(CaptureId, RunningError)> = state
            .task_positions
            .iter()
            .filter_map(|(capture, position)| {
                position
                    .warning
                    .clone()
                    .map(|warning| (capture.clone(), warning))
            })
            .collect();

        let mut collected = BTreeMap::new();
        for (capture, warning) in reporting {
            tracing::warn!(capture = %capture, warning = %warning, "processor reported a warning");
            collected.insert(warning.code.clone(), warning);
            state.patch_task_position(&capture, |position| {
                let Some(mut position) = position else {
                    return Ok((None, false));
                };
                let changed = position.warning.take().is_some();
                Ok((Some(position), changed))
            });
        }
        collected.into_values().collect()
    }

    async fn handle_errors(&mut self, state: &mut ChangefeedState, errors: &[RunningError]) {
        // A fast-fail fault terminates the feed outright; the rest of the
        // batch is moot.
        for error in errors {
            if self.classifier.is_fast_fail(&error.code) {
                tracing::error!(error = %error, "changefeed met a fast-fail error");
                record_error(state, error.clone());
                self.should_running = false;
                self.patch_state(state, FeedState::Failed).await;
                return;
            }
        }

        // A stopped changefeed must not be resurrected by late reports;
        // of the transitions out of `Stopped`, only fast-fail applies.
        if state
            .info
            .as_ref()
            .map_or(false, |info| info.state == FeedState::Stopped)
        {
            tracing::warn!(count = errors.len(), "changefeed is stopped, ignoring reported errors");
            return;
        }

        for error in errors {
            if self.classifier.is_unretryable(&error.code) {
                tracing::error!(error = %error, "changefeed met an unretryable error");
                record_error(state, error.clone());
                self.should_running = false;
                self.patch_state(state, FeedState::Error).await;
                return;
            }
        }

        if let Some(last) = errors.last() {
            record_error(state, last.clone());
        }

        let now = self.oracle.current_time();
        if !errors.is_empty() {
            if self.last_error_time.is_none() {
                self.last_error_time = Some(now);
            }
            if self.state_window.is_stable() {
                // The feed was healthy and just broke: back off from the
                // initial interval again.
                self.reset_backoff(now);
            }
        } else if state
            .info
            .as_ref()
            .map_or(false, |info| info.state == FeedState::Normal)
        {
            self.last_error_time = None;
        }
        self.state_window.push(
            state
                .info
                .as_ref()
                .map_or(FeedState::Normal, |info| info.state),
        );

        let Some(first_error_at) = self.last_error_time else {
            return;
        };

        if now - first_error_at < TimeDelta::from_std(self.backoff_interval).unwrap_or(TimeDelta::MAX)
        {
            // Still inside the restart delay: keep the feed down.
            self.should_running = false;
            self.patch_state(state, FeedState::Error).await;
        } else {
            let previous_interval = self.backoff_interval;
            let next_interval = self.backoff.next(now);
            self.last_error_time = None;
            match next_interval {
                Some(interval) => {
                    self.backoff_interval = interval;
                    tracing::info!(
                        ?previous_interval,
                        ?interval,
                        "restart delay elapsed, changefeed may run again",
                    );
                }
                None => {
                    tracing::error!(
                        "changefeed has been failing longer than the backoff budget, failing it for good",
                    );
                    self.should_running = false;
                    self.patch_state(state, FeedState::Failed).await;
                }
            }
        }
    }

    /// Warnings are recorded for observers but affect neither the desired
    /// run state nor the backoff.
    fn handle_warnings(&self, state: &mut ChangefeedState, warnings: &[RunningError]) {
        let Some(last) = warnings.last() else {
            return;
        };
        let warning = last.clone();
        state.patch_info(move |info| {
            let Some(mut info) = info else {
                return Ok((None, false));
            };
            let changed = info.warning.as_ref() != Some(&warning);
            info.warning = Some(warning);
            Ok((Some(info), changed))
        });
    }

    /// Patch the feed towards `target`, mirroring the matching admin-job
    /// type onto info and status and stamping a fresh epoch on terminal
    /// transitions. Patches are elided when the observed values already
    /// match; the closures re-validate against the latest values anyway.
    async fn patch_state(&mut self, state: &mut ChangefeedState, target: FeedState) {
        let (admin_job_type, update_epoch) = match target {
            FeedState::Normal => (AdminJobType::None, false),
            FeedState::Finished => (AdminJobType::Finish, true),
            FeedState::Error | FeedState::Stopped | FeedState::Failed => (AdminJobType::Stop, true),
            FeedState::Removed => (AdminJobType::Remove, true),
            FeedState::Warning => {
                // Warnings land on info.warning, never on the feed state.
                debug_assert!(false, "cannot patch the feed state to {target}");
                tracing::error!(target = %target, "refusing to patch the feed state");
                return;
            }
        };

        if state
            .status
            .as_ref()
            .map_or(false, |status| status.admin_job_type != admin_job_type)
        {
            state.patch_status(move |status| {
                let Some(mut status) = status else {
                    return Ok((None, false));
                };
                let changed = status.admin_job_type != admin_job_type;
                status.admin_job_type = admin_job_type;
                Ok((Some(status), changed))
            });
        }

        let Some(observed) = state.info.as_ref() else {
            return;
        };
        if observed.state == target && observed.admin_job_type == admin_job_type {
            return;
        }
        let epoch = if update_epoch && observed.admin_job_type != admin_job_type {
            Some(oracle::generate_epoch(self.oracle.as_ref()).await)
        } else {
            None
        };
        state.patch_info(move |info| {
            let Some(mut info) = info else {
                return Ok((None, false));
            };
            let mut changed = false;
            if info.state != target {
                info.state = target;
                changed = true;
            }
            if info.admin_job_type != admin_job_type {
                info.admin_job_type = admin_job_type;
                changed = true;
                if let Some(epoch) = epoch {
                    let previous_epoch = info.epoch;
                    info.epoch = epoch;
                    tracing::info!(previous_epoch, epoch, "updated changefeed epoch");
                }
            }
            Ok((Some(info), changed))
        });
    }

    /// Clear every task position so processors deallocate on their next
    /// reconcile. Runs whenever a tick concludes the feed should not run.
    fn clean_up_task_positions(&self, state: &mut ChangefeedState) {
        let captures: Vec<CaptureId> = state.task_positions.keys().cloned().collect();
        for capture in captures {
            state.patch_task_position(&capture, |position| Ok((None, position.is_some())));
        }
    }

    fn reset_backoff(&mut self, now: DateTime<Utc>) {
        self.backoff.reset(now);
        self.backoff_interval = self.backoff.next(now).unwrap_or(INITIAL_BACKOFF_INTERVAL);
    }

    #[cfg(test)]
    fn backoff_interval(&self) -> Duration {
        self.backoff_interval
    }

    #[cfg(test)]
    fn last_error_time(&self) -> Option<DateTime<Utc>> {
        self.last_error_time
    }
}

fn record_error(state: &mut ChangefeedState, error: RunningError) {
    state.patch_info(move |info| {
        let Some(mut info) = info else {
            return Ok((None, false));
        };
        let changed = info.error.as_ref() != Some(&error);
        info.error = Some(error);
        Ok((Some(info), changed))
    });
}

use model::{AdminJob, AdminJobType};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// FIFO of operator commands addressed to one changefeed.
///
/// Cloneable handle over shared storage: API threads enqueue through a clone
/// while the reconciliation loop drains through the manager. Jobs pushed
/// before a tick boundary are consumed in push order; jobs arriving during a
/// tick become visible no earlier than the next tick, because the manager
/// takes the lock exactly once per tick.
#[derive(Clone, Debug, Default)]
pub struct AdminJobQueue(Arc<Mutex<VecDeque<AdminJob>>>);

impl AdminJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an operator command. Only `Stop`, `Resume`, and `Remove` may
    /// enter from outside; `Finish` is produced internally when the feed's
    /// sinks report completion, and `None` is not a command.
    pub fn push(&self, job: AdminJob) -> anyhow::Result<()> {
        match job.kind {
            AdminJobType::Stop | AdminJobType::Resume | AdminJobType::Remove => {}
            kind => anyhow::bail!("admin job kind {kind} cannot be pushed by operators"),
        }
        self.0.lock().unwrap().push_back(job);
        Ok(())
    }

    /// Enqueue a finish job, at most one pending at a time.
    pub(crate) fn push_finish(&self, job: AdminJob) {
        let mut jobs = self.0.lock().unwrap();
        if jobs.iter().any(|queued| queued.kind == AdminJobType::Finish) {
            return;
        }
        jobs.push_back(job);
    }

    pub(crate) fn pop(&self) -> Option<AdminJob> {
        self.0.lock().unwrap().pop_front()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use model::ChangefeedId;

    fn job(kind: AdminJobType) -> AdminJob {
        AdminJob {
            id: ChangefeedId::new("default", "orders").unwrap(),
            kind,
            overwrite_checkpoint_ts: None,
        }
    }

    #[test]
    fn jobs_are_consumed_in_push_order() {
        let queue = AdminJobQueue::new();
        queue.push(job(AdminJobType::Stop)).unwrap();
        queue.push(job(AdminJobType::Resume)).unwrap();

        assert_eq!(queue.pop().unwrap().kind, AdminJobType::Stop);
        assert_eq!(queue.pop().unwrap().kind, AdminJobType::Resume);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn operator_pushes_reject_internal_kinds() {
        let queue = AdminJobQueue::new();
        assert!(queue.push(job(AdminJobType::Finish)).is_err());
        assert!(queue.push(job(AdminJobType::None)).is_err());
        assert!(queue.pop().is_none());
    }

    #[test]
    fn at_most_one_finish_job_is_queued() {
        let queue = AdminJobQueue::new();
        queue.push_finish(job(AdminJobType::Finish));
        queue.push_finish(job(AdminJobType::Finish));

        assert_eq!(queue.pop().unwrap().kind, AdminJobType::Finish);
        assert!(queue.pop().is_none());
    }
}

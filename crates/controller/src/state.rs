use model::{CaptureId, ChangefeedId, ChangefeedInfo, ChangefeedStatus, TaskPosition};
use std::collections::BTreeMap;

/// Patch closure over the persisted info document. It receives the latest
/// value the persistence layer observes at application time and returns the
/// new value plus a changed flag; `false` means the write is elided.
pub type InfoPatchFn =
    Box<dyn FnOnce(Option<ChangefeedInfo>) -> anyhow::Result<(Option<ChangefeedInfo>, bool)> + Send>;

pub type StatusPatchFn = Box<
    dyn FnOnce(Option<ChangefeedStatus>) -> anyhow::Result<(Option<ChangefeedStatus>, bool)> + Send,
>;

pub type PositionPatchFn =
    Box<dyn FnOnce(Option<TaskPosition>) -> anyhow::Result<(Option<TaskPosition>, bool)> + Send>;

/// One intended mutation of persisted changefeed data.
///
/// Patches are pure over the value they are handed, never over values read
/// earlier: the persistence collaborator may apply them against a newer
/// revision than the one the manager observed, under its own transactional
/// discipline, and the outcome must still be correct.
pub enum DataPatch {
    Info(InfoPatchFn),
    Status(StatusPatchFn),
    TaskPosition(CaptureId, PositionPatchFn),
}

impl std::fmt::Debug for DataPatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataPatch::Info(_) => f.write_str("DataPatch::Info"),
            DataPatch::Status(_) => f.write_str("DataPatch::Status"),
            DataPatch::TaskPosition(capture, _) => {
                write!(f, "DataPatch::TaskPosition({capture})")
            }
        }
    }
}

/// The manager's view of one changefeed's persisted data, plus the journal
/// of patches it decided on during the current tick.
///
/// The observed fields are a snapshot taken by the reconciliation loop;
/// patches enqueued during a tick do not feed back into them until the
/// persistence layer applies the journal and the next snapshot is taken.
#[derive(Debug)]
pub struct ChangefeedState {
    pub id: ChangefeedId,
    pub info: Option<ChangefeedInfo>,
    pub status: Option<ChangefeedStatus>,
    pub task_positions: BTreeMap<CaptureId, TaskPosition>,
    patches: Vec<DataPatch>,
}

impl ChangefeedState {
    pub fn new(id: ChangefeedId) -> Self {
        Self {
            id,
            info: None,
            status: None,
            task_positions: BTreeMap::new(),
            patches: Vec::new(),
        }
    }

    pub fn patch_info<F>(&mut self, update: F)
    where
        F: FnOnce(Option<ChangefeedInfo>) -> anyhow::Result<(Option<ChangefeedInfo>, bool)>
            + Send
            + 'static,
    {
        self.patches.push(DataPatch::Info(Box::new(update)));
    }

    pub fn patch_status<F>(&mut self, update: F)
    where
        F: FnOnce(Option<ChangefeedStatus>) -> anyhow::Result<(Option<ChangefeedStatus>, bool)>
            + Send
            + 'static,
    {
        self.patches.push(DataPatch::Status(Box::new(update)));
    }

    pub fn patch_task_position<F>(&mut self, capture: &str, update: F)
    where
        F: FnOnce(Option<TaskPosition>) -> anyhow::Result<(Option<TaskPosition>, bool)>
            + Send
            + 'static,
    {
        self.patches
            .push(DataPatch::TaskPosition(capture.to_string(), Box::new(update)));
    }

    /// Number of patches currently journaled.
    pub fn pending_patches(&self) -> usize {
        self.patches.len()
    }

    /// Hand the journal to the persistence collaborator, leaving it empty.
    pub fn take_patches(&mut self) -> Vec<DataPatch> {
        std::mem::take(&mut self.patches)
    }

    /// Apply the journal to this snapshot, in order, under the same
    /// read-latest/changed-flag discipline the persistence layer uses.
    /// Returns how many patches reported a change.
    pub fn apply_patches(&mut self) -> anyhow::Result<usize> {
        let mut applied = 0;
        for patch in std::mem::take(&mut self.patches) {
            match patch {
                DataPatch::Info(update) => {
                    let (next, changed) = update(self.info.clone())?;
                    if changed {
                        self.info = next;
                        applied += 1;
                    }
                }
                DataPatch::Status(update) => {
                    let (next, changed) = update(self.status.clone())?;
                    if changed {
                        self.status = next;
                        applied += 1;
                    }
                }
                DataPatch::TaskPosition(capture, update) => {
                    let (next, changed) = update(self.task_positions.get(&capture).cloned())?;
                    if changed {
                        match next {
                            Some(position) => {
                                self.task_positions.insert(capture, position);
                            }
                            None => {
                                self.task_positions.remove(&capture);
                            }
                        }
                        applied += 1;
                    }
                }
            }
        }
        Ok(applied)
    }
}

//! Trigger → task row + queued payload.

use log::{info, warn};
use std::sync::Arc;

use crate::broker::{Broker, TaskPayload, queue_name};
use crate::catalog::ModuleRule;
use crate::error::DispatchError;
use crate::naming::render_output;
use crate::store::CoordinationStore;
use crate::{CaseContext, TaskInput, TaskRecord};

/// A task that reached the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskId {
    pub module: String,
    /// Row in the module's task table.
    pub row_id: i64,
    pub queue: String,
}

pub struct TaskDispatcher {
    store: Arc<CoordinationStore>,
    broker: Arc<dyn Broker>,
    agent: String,
}

impl TaskDispatcher {
    pub fn new(store: Arc<CoordinationStore>, broker: Arc<dyn Broker>, agent: impl Into<String>) -> Self {
        Self {
            store,
            broker,
            agent: agent.into(),
        }
    }

    /// Record `task_created` for `input`, then submit to the module's queue.
    ///
    /// Returns once the payload is enqueued. If enqueueing fails the row is removed again,
    /// so a task that never reached a queue does not hold the case open.
    pub fn dispatch(
        &self,
        rule: &ModuleRule,
        input: TaskInput,
        case: &CaseContext,
    ) -> Result<TaskId, DispatchError> {
        let output = render_output(rule, &case.case_path, &input);
        let mut record = TaskRecord::created(case, &self.agent, &input);
        record.output_dir = output.output_dir.to_string_lossy().into_owned();
        record.output_file = output.output_file.clone();
        record.output_prefix = output.output_prefix.clone();

        let row_id = self
            .store
            .record_task(&rule.name, &record)
            .map_err(|source| DispatchError::Record {
                module: rule.name.clone(),
                source,
            })?;

        let queue = queue_name(&rule.constraints);
        let payload = TaskPayload {
            input_hint: input.path().to_path_buf(),
            case_path: case.case_path.clone(),
            case_id: case.case_id.clone(),
            module: rule.clone(),
            input,
            output,
            queue: queue.clone(),
        };

        let submitted = match payload.encode() {
            Ok(encoded) => self
                .broker
                .submit(&queue, &encoded)
                .map_err(|source| DispatchError::Enqueue {
                    module: rule.name.clone(),
                    queue: queue.clone(),
                    source,
                }),
            Err(source) => Err(DispatchError::Encode {
                module: rule.name.clone(),
                source,
            }),
        };
        if let Err(e) = submitted {
            if let Err(re) = self.store.retract_task(&rule.name, row_id) {
                warn!("{}: could not retract row {}: {:#}", rule.name, row_id, re);
            }
            return Err(e);
        }

        info!(
            "{} <- {} ({})",
            queue,
            payload.input_hint.display(),
            rule.name
        );
        Ok(TaskId {
            module: rule.name.clone(),
            row_id,
            queue,
        })
    }
}

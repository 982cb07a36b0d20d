//! Workflows: the immutable itinerary a plate executes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::deck::{DeviceId, DeviceType, StationId};
use crate::error::{Error, Result};

/// A single stop in a workflow.
///
/// `duration: None` means the device signals completion asynchronously
/// rather than running for a fixed time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub step_id: String,
    pub name: String,
    pub station_id: StationId,
    pub device_id: DeviceId,
    pub device_type: DeviceType,
    #[serde(default)]
    pub duration: Option<Duration>,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl WorkflowStep {
    pub fn new(
        step_id: impl Into<String>,
        name: impl Into<String>,
        station_id: impl Into<StationId>,
        device_id: impl Into<DeviceId>,
        device_type: DeviceType,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            name: name.into(),
            station_id: station_id.into(),
            device_id: device_id.into(),
            device_type,
            duration: None,
            parameters: serde_json::Value::Null,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// An ordered list of steps. Immutable once constructed; the step list
/// is never exposed mutably.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    workflow_id: String,
    steps: Vec<WorkflowStep>,
}

impl Workflow {
    pub fn new(workflow_id: impl Into<String>, steps: Vec<WorkflowStep>) -> Result<Self> {
        let workflow_id = workflow_id.into();
        if workflow_id.is_empty() {
            return Err(Error::invalid_workflow("workflow id must not be empty"));
        }
        Ok(Self { workflow_id, steps })
    }

    pub fn id(&self) -> &str {
        &self.workflow_id
    }

    pub fn steps(&self) -> &[WorkflowStep] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&WorkflowStep> {
        self.steps.get(index)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_workflow_id() {
        assert!(Workflow::new("", vec![]).is_err());
    }

    #[test]
    fn steps_are_ordered_and_indexed() {
        let wf = Workflow::new(
            "wf-1",
            vec![
                WorkflowStep::new("s0", "delid", "STATION_1", "lidmate-1", DeviceType::Lidmate),
                WorkflowStep::new("s1", "read", "STATION_2", "reader-1", DeviceType::Reader)
                    .with_duration(Duration::from_secs(1)),
            ],
        )
        .ok();
        assert!(wf.is_some());
        if let Some(wf) = wf {
            assert_eq!(wf.len(), 2);
            assert_eq!(wf.step(0).map(|s| s.name.as_str()), Some("delid"));
            assert_eq!(
                wf.step(1).and_then(|s| s.duration),
                Some(Duration::from_secs(1))
            );
            assert!(wf.step(2).is_none());
        }
    }
}

//! Step configuration.

use rustc_hash::FxHashMap;

use crate::error::DebugError;
use crate::host::EventContext;
use crate::source::{SourceElement, SuspendAnchor};

/// Granularity and repeat count of a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepConfig {
    source_elements: Option<Vec<SourceElement>>,
    anchors: FxHashMap<SourceElement, Vec<SuspendAnchor>>,
    count: u32,
}

impl StepConfig {
    #[must_use]
    pub fn builder() -> StepConfigBuilder {
        StepConfigBuilder::default()
    }

    /// Step over the session's elements `count` times.
    pub fn count(count: u32) -> Result<Self, DebugError> {
        Self::builder().count(count).build()
    }

    #[must_use]
    pub fn step_count(&self) -> u32 {
        self.count
    }

    #[must_use]
    pub fn source_elements(&self) -> Option<&[SourceElement]> {
        self.source_elements.as_deref()
    }

    /// Check that every element this step asks for is enabled in the session.
    pub(crate) fn validate_for(&self, session_elements: &[SourceElement]) -> Result<(), DebugError> {
        if let Some(elements) = &self.source_elements {
            for element in elements {
                if !session_elements.contains(element) {
                    return Err(DebugError::invalid_state(format!(
                        "source element {element:?} is not enabled in the session"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Whether the point carries a requested element at an anchor valid for it.
    pub(crate) fn matches(
        &self,
        session_elements: &[SourceElement],
        context: &dyn EventContext,
        anchor: SuspendAnchor,
    ) -> bool {
        let elements = self.source_elements.as_deref().unwrap_or(session_elements);
        elements.iter().any(|element| {
            context.has_tag(element.tag())
                && self
                    .anchors
                    .get(element)
                    .map_or(element.suspend_anchors(), Vec::as_slice)
                    .contains(&anchor)
        })
    }
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            source_elements: None,
            anchors: FxHashMap::default(),
            count: 1,
        }
    }
}

/// Builder for [`StepConfig`].
#[derive(Debug, Default)]
pub struct StepConfigBuilder {
    source_elements: Option<Vec<SourceElement>>,
    anchors: Vec<(SourceElement, Vec<SuspendAnchor>)>,
    count: Option<u32>,
}

impl StepConfigBuilder {
    /// Restrict the step to these elements instead of the session's.
    #[must_use]
    pub fn source_elements(mut self, elements: &[SourceElement]) -> Self {
        self.source_elements = Some(elements.to_vec());
        self
    }

    /// Narrow the anchors an element stops at.
    #[must_use]
    pub fn suspend_anchors(mut self, element: SourceElement, anchors: &[SuspendAnchor]) -> Self {
        self.anchors.push((element, anchors.to_vec()));
        self
    }

    #[must_use]
    pub fn count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    pub fn build(self) -> Result<StepConfig, DebugError> {
        let count = self.count.unwrap_or(1);
        if count == 0 {
            return Err(DebugError::invalid_argument("step count must be > 0"));
        }
        if let Some(elements) = &self.source_elements {
            if elements.is_empty() {
                return Err(DebugError::invalid_argument("no source elements"));
            }
        }
        let mut anchors = FxHashMap::default();
        for (element, element_anchors) in self.anchors {
            if let Some(elements) = &self.source_elements {
                if !elements.contains(&element) {
                    return Err(DebugError::invalid_argument(format!(
                        "source element {element:?} is not part of the step"
                    )));
                }
            }
            if element_anchors.is_empty() {
                return Err(DebugError::invalid_argument("no suspend anchors"));
            }
            if let Some(anchor) = element_anchors
                .iter()
                .find(|anchor| !element.suspend_anchors().contains(anchor))
            {
                return Err(DebugError::invalid_argument(format!(
                    "anchor {anchor:?} is not supported by {element:?}"
                )));
            }
            anchors.insert(element, element_anchors);
        }
        Ok(StepConfig {
            source_elements: self.source_elements,
            anchors,
            count,
        })
    }
}

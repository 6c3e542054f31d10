//! Debugger configuration loading.

use std::path::Path;

use serde::Deserialize;

use crate::breakpoint::BreakpointKind;
use crate::error::DebugError;
use crate::filter::SuspensionFilter;
use crate::source::SourceElement;

/// Defaults applied to every session started by a debugger.
#[derive(Debug, Clone)]
pub struct DebuggerConfig {
    pub source_elements: Vec<SourceElement>,
    pub suspension_filter: SuspensionFilter,
    pub halt_instruction_active: bool,
    pub source_location_active: bool,
    pub exception_active: bool,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            source_elements: vec![SourceElement::Statement],
            suspension_filter: SuspensionFilter::default(),
            halt_instruction_active: true,
            source_location_active: true,
            exception_active: true,
        }
    }
}

impl DebuggerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, DebugError> {
        let raw: DebuggerToml = toml::from_str(text)
            .map_err(|err| DebugError::InvalidConfig(format!("debugger.toml: {err}").into()))?;
        raw.into_config()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, DebugError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            DebugError::InvalidConfig(format!("{}: {err}", path.display()).into())
        })?;
        Self::from_toml_str(&text)
    }

    #[must_use]
    pub fn breakpoints_active(&self, kind: BreakpointKind) -> bool {
        match kind {
            BreakpointKind::HaltInstruction => self.halt_instruction_active,
            BreakpointKind::SourceLocation => self.source_location_active,
            BreakpointKind::Exception => self.exception_active,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DebuggerToml {
    #[serde(default)]
    session: SessionSection,
    #[serde(default)]
    breakpoints: BreakpointsSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SessionSection {
    source_elements: Option<Vec<SourceElement>>,
    include_internal: Option<bool>,
    ignore_language_context_initialization: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BreakpointsSection {
    active: Option<bool>,
    #[serde(default)]
    kinds: KindsSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct KindsSection {
    halt_instruction: Option<bool>,
    source_location: Option<bool>,
    exception: Option<bool>,
}

impl DebuggerToml {
    fn into_config(self) -> Result<DebuggerConfig, DebugError> {
        let mut source_elements = self
            .session
            .source_elements
            .unwrap_or_else(|| vec![SourceElement::Statement]);
        if source_elements.is_empty() {
            return Err(DebugError::InvalidConfig(
                "session.source_elements must not be empty".into(),
            ));
        }
        source_elements.sort();
        source_elements.dedup();

        let suspension_filter = SuspensionFilter::builder()
            .include_internal(self.session.include_internal.unwrap_or(false))
            .ignore_language_context_initialization(
                self.session
                    .ignore_language_context_initialization
                    .unwrap_or(false),
            )
            .build();

        let active = self.breakpoints.active.unwrap_or(true);
        let kinds = self.breakpoints.kinds;
        Ok(DebuggerConfig {
            source_elements,
            suspension_filter,
            halt_instruction_active: kinds.halt_instruction.unwrap_or(active),
            source_location_active: kinds.source_location.unwrap_or(active),
            exception_active: kinds.exception.unwrap_or(active),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = DebuggerConfig::from_toml_str("").unwrap();
        assert_eq!(config.source_elements, vec![SourceElement::Statement]);
        assert!(!config.suspension_filter.is_internal_included());
        assert!(config.breakpoints_active(BreakpointKind::Exception));
    }

    #[test]
    fn parses_session_and_breakpoint_sections() {
        let config = DebuggerConfig::from_toml_str(
            r#"
[session]
source_elements = ["expression", "statement", "expression"]
include_internal = true
ignore_language_context_initialization = true

[breakpoints]
active = false

[breakpoints.kinds]
halt_instruction = true
"#,
        )
        .unwrap();
        assert_eq!(
            config.source_elements,
            vec![SourceElement::Statement, SourceElement::Expression]
        );
        assert!(config.suspension_filter.is_internal_included());
        assert!(config
            .suspension_filter
            .is_ignore_language_context_initialization());
        assert!(config.breakpoints_active(BreakpointKind::HaltInstruction));
        assert!(!config.breakpoints_active(BreakpointKind::SourceLocation));
        assert!(!config.breakpoints_active(BreakpointKind::Exception));
    }

    #[test]
    fn rejects_empty_elements_and_unknown_keys() {
        let err = DebuggerConfig::from_toml_str("[session]\nsource_elements = []\n").unwrap_err();
        assert!(matches!(err, DebugError::InvalidConfig(_)));
        let err = DebuggerConfig::from_toml_str("[session]\nstep = 1\n").unwrap_err();
        assert!(matches!(err, DebugError::InvalidConfig(_)));
        let err =
            DebuggerConfig::from_toml_str("[session]\nsource_elements = [\"call\"]\n").unwrap_err();
        assert!(matches!(err, DebugError::InvalidConfig(_)));
    }
}

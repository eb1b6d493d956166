// src/translate/local.rs

use crate::errors::Result;
use crate::resources::ResourceSpec;
use crate::translate::DirectiveTranslator;
use crate::translate::shell::{check_single_host, export_lines};
use crate::types::SchedulerFamily;

/// Unscheduled local process. Same rules as the shell family, but the wall
/// time is not enforced.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTranslator;

impl DirectiveTranslator for LocalTranslator {
    fn family(&self) -> SchedulerFamily {
        SchedulerFamily::Local
    }

    fn check_supported(&self, spec: &ResourceSpec) -> Result<()> {
        check_single_host(spec, self.family())
    }

    fn render_lines(&self, spec: &ResourceSpec) -> Vec<String> {
        export_lines(spec)
    }
}

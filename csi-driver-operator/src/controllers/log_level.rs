use async_trait::async_trait;
use csi_driver_operator_apis::LogLevel;
use log::LevelFilter;

use crate::controller_set::{Controller, ReconcileOutcome, SyncContext};

/// Applies `spec.operatorLogLevel` to the operator's own logger.
pub(crate) struct LogLevelController {
    name: String,
}

impl LogLevelController {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

pub(crate) fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Normal => LevelFilter::Info,
        LogLevel::Debug => LevelFilter::Debug,
        LogLevel::Trace | LogLevel::TraceAll => LevelFilter::Trace,
    }
}

#[async_trait]
impl Controller for LogLevelController {
    fn name(&self) -> &str {
        &self.name
    }

    fn honors_management_state(&self) -> bool {
        false
    }

    async fn sync(&self, ctx: &SyncContext) -> ReconcileOutcome {
        let desired = level_filter(ctx.spec().operator_log_level());
        let current = log::max_level();
        if current == desired {
            return ReconcileOutcome::default();
        }
        log::set_max_level(desired);
        info!("{}: log level changed from {} to {}", self.name, current, desired);
        ReconcileOutcome {
            changed: true,
            ..Default::default()
        }
    }
}

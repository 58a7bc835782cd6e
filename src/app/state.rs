use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::HoardConfig;
use crate::db::Db;

/// The shared app state: one of these gets built at startup and every
/// request handler sees it by Arc. The db (and through it, the write
/// coordinator handle) rides in here -- handlers reach the coordinator
/// through the state they were constructed with, never through a global.
pub type HoardState = Arc<HoardInner>;

pub struct HoardInner {
    pub db: Db,
    pub config: HoardConfig,
    pub task_tracker: TaskTracker,
    pub cancel_token: CancellationToken,
}

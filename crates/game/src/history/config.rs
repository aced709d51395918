use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Store every field on every log, even when the comparator says it
    /// did not change.
    pub log_everything: bool,
    /// Timestamp units kept behind the newest frame by `prune`; `None`
    /// keeps everything.
    pub retention: Option<u64>,
}

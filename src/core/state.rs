//! 状态定义：轮次阶段、轮次记录与统计
//!
//! TurnPhase 是编排状态机的阶段（事件与日志用）；TurnRecord / AgentStatistics 为每轮完成后的审计投影。

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// 编排状态机阶段：RECEIVED → MODEL_CALL → {TOOLS_REQUESTED → DISPATCH → MODEL_CALL}* → DONE | FAILED
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Received,
    ModelCall,
    ToolsRequested,
    Dispatch,
    Done,
    Failed,
}

impl TurnPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, TurnPhase::Done | TurnPhase::Failed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Completed,
    Failed,
}

/// 一轮结束后的记录
#[derive(Clone, Debug, Serialize)]
pub struct TurnRecord {
    pub id: String,
    pub command: String,
    pub status: TurnStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    /// 本轮模型调用次数
    pub iterations: usize,
    /// 本轮分发的工具调用数
    pub tool_calls: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub execution_time: Duration,
}

impl TurnRecord {
    pub fn is_completed(&self) -> bool {
        self.status == TurnStatus::Completed
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

/// 累计统计
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AgentStatistics {
    pub total_turns: u64,
    pub completed_turns: u64,
    pub failed_turns: u64,
    #[serde(with = "duration_secs")]
    pub total_execution_time: Duration,
}

impl AgentStatistics {
    pub fn record(&mut self, record: &TurnRecord) {
        self.total_turns += 1;
        match record.status {
            TurnStatus::Completed => self.completed_turns += 1,
            TurnStatus::Failed => self.failed_turns += 1,
        }
        self.total_execution_time += record.execution_time;
    }

    /// 成功率（百分比，保留一位小数）；无记录时为 0
    pub fn success_rate(&self) -> f64 {
        if self.total_turns == 0 {
            return 0.0;
        }
        let pct = self.completed_turns as f64 / self.total_turns as f64 * 100.0;
        (pct * 10.0).round() / 10.0
    }

    pub fn average_execution_time(&self) -> Duration {
        if self.total_turns == 0 {
            return Duration::ZERO;
        }
        self.total_execution_time.div_f64(self.total_turns as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: TurnStatus, secs: u64) -> TurnRecord {
        let now = Utc::now();
        TurnRecord {
            id: "t".into(),
            command: "c".into(),
            status,
            result: None,
            error: None,
            iterations: 1,
            tool_calls: 0,
            started_at: now,
            finished_at: now,
            execution_time: Duration::from_secs(secs),
        }
    }

    #[test]
    fn test_statistics_rates() {
        let mut stats = AgentStatistics::default();
        assert_eq!(stats.success_rate(), 0.0);
        assert_eq!(stats.average_execution_time(), Duration::ZERO);

        stats.record(&record(TurnStatus::Completed, 1));
        stats.record(&record(TurnStatus::Completed, 2));
        stats.record(&record(TurnStatus::Failed, 3));
        assert_eq!(stats.total_turns, 3);
        assert_eq!(stats.failed_turns, 1);
        assert_eq!(stats.success_rate(), 66.7);
        assert_eq!(stats.average_execution_time(), Duration::from_secs(2));
    }

    #[test]
    fn test_record_serializes_seconds() {
        let json = serde_json::to_value(record(TurnStatus::Failed, 2)).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["execution_time"], 2.0);
        assert!(TurnPhase::Done.is_terminal());
        assert!(!TurnPhase::Dispatch.is_terminal());
    }
}

/// 部分成功ハンドリングとスキップ／フォールバック判断の記録。
use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use uuid::Uuid;

/// 判断を下したステージ。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Select,
    Train,
    Assign,
    Report,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Select => "select",
            Stage::Train => "train",
            Stage::Assign => "assign",
            Stage::Report => "report",
        };
        f.write_str(name)
    }
}

/// 正常系から外れた判断の種類。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DegradationKind {
    TooFewSamples,
    RangeCollapsed,
    CandidateFitFailed { k: usize },
    MetricFallback,
    ClusterCountRaised { from: usize, to: usize },
    ClusterCountReduced { from: usize, to: usize },
    TrainingSkipped,
    MetricExtractionFailed,
    MissingModel,
    MissingFeatures,
    RowCountMismatch { labels: usize, records: usize },
    MissingAssignments,
}

/// 1件のスキップ／フォールバック／調整の記録。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Degradation {
    pub stage: Stage,
    pub partition: String,
    #[serde(flatten)]
    pub kind: DegradationKind,
    pub detail: String,
}

impl Degradation {
    pub fn new(
        stage: Stage,
        partition: impl Into<String>,
        kind: DegradationKind,
        detail: impl Into<String>,
    ) -> Self {
        let degradation = Self {
            stage,
            partition: partition.into(),
            kind,
            detail: detail.into(),
        };
        tracing::warn!(
            stage = %degradation.stage,
            partition = %degradation.partition,
            kind = ?degradation.kind,
            detail = %degradation.detail,
            "partition degraded"
        );
        degradation
    }
}

/// ラン全体の部分成功の分析結果。
#[derive(Debug, Clone, Serialize)]
pub struct PartialSuccess {
    pub run_id: Uuid,
    pub completed: Vec<String>,
    pub skipped: Vec<String>,
    pub degradations: Vec<Degradation>,
}

impl PartialSuccess {
    /// 入力パーティションと最終的に完了したパーティションから部分成功を分析する。
    pub fn analyze<'a>(
        run_id: Uuid,
        expected: impl IntoIterator<Item = &'a String>,
        completed: impl IntoIterator<Item = &'a String>,
        degradations: Vec<Degradation>,
    ) -> Self {
        let completed: BTreeSet<String> = completed.into_iter().cloned().collect();
        let skipped = expected
            .into_iter()
            .filter(|partition| !completed.contains(*partition))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        Self {
            run_id,
            completed: completed.into_iter().collect(),
            skipped,
            degradations,
        }
    }

    /// すべてのパーティションが最後まで処理されたかどうか。
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }

    /// 指定パーティションに関する記録。
    pub fn for_partition<'a>(&'a self, partition: &'a str) -> impl Iterator<Item = &'a Degradation> {
        self.degradations
            .iter()
            .filter(move |d| d.partition == partition)
    }
}

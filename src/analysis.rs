//! Feature Diff Analyzer
//!
//! Joins validation labels with the activation snapshots of the same turns
//! and aggregates every decoded feature by label: how many turns of each
//! terminal label carry it in their top-N list, and its mean activation
//! under each label (absent = 0).
//!
//! Features are then scored by how much more often they show up in
//! confabulated turns than in honest ones:
//!
//! ```text
//! specificity = p(feature in top-N | CONFABULATION) - p(feature in top-N | HONEST)
//! ```
//!
//! where HONEST is `HONEST_NO_TOOL` together with `HONEST_TOOL_USE`.
//! `TOOL_MISREPORT` turns are aggregated but belong to neither side of the
//! score. `UNRESOLVED` turns are only counted.
//!
//! A Welch t-test on activation strength is attached when both sides hold
//! at least two turns.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use tracing::{info, warn};

use crate::annotations::FeatureAnnotations;
use crate::error::Result;
use crate::records::ActivationSnapshot;
use crate::validation::{LogCorpus, TurnLabel, ValidationLabel};

/// Per-feature statistics conditioned on the terminal labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureStat {
    pub feature_index: usize,
    /// Turns of each label whose top-N list holds the feature
    pub count_by_label: BTreeMap<TurnLabel, usize>,
    /// Mean activation over all turns of each label
    pub mean_activation_by_label: BTreeMap<TurnLabel, f64>,
    pub p_confab: f64,
    pub p_honest: f64,
    pub specificity_score: f64,
    pub t_statistic: Option<f64>,
    pub p_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FeatureStat {
    pub fn count(&self, label: TurnLabel) -> usize {
        self.count_by_label.get(&label).copied().unwrap_or(0)
    }

    pub fn mean_activation(&self, label: TurnLabel) -> f64 {
        self.mean_activation_by_label
            .get(&label)
            .copied()
            .unwrap_or(0.0)
    }
}

/// Output of one analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDiffReport {
    /// Turns with a snapshot, per terminal label
    pub n_by_label: BTreeMap<TurnLabel, usize>,
    pub n_confabulation: usize,
    pub n_honest: usize,
    /// Turns left out because the judge never gave a verdict
    pub excluded_unresolved: usize,
    /// Labelled turns without a logged snapshot
    pub missing_snapshots: usize,
    /// Sorted by specificity, highest first
    pub stats: Vec<FeatureStat>,
}

impl FeatureDiffReport {
    pub fn top(&self, k: usize) -> &[FeatureStat] {
        &self.stats[..k.min(self.stats.len())]
    }

    pub fn stat(&self, feature: usize) -> Option<&FeatureStat> {
        self.stats.iter().find(|s| s.feature_index == feature)
    }

    /// Attach descriptions for annotated features.
    pub fn annotate(&mut self, annotations: &FeatureAnnotations) {
        for stat in &mut self.stats {
            stat.description = annotations.get(stat.feature_index).map(str::to_string);
        }
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("Wrote {} feature stats to {}", self.stats.len(), path.display());
        Ok(())
    }
}

/// Snapshots grouped by terminal label.
type LabelGroups<'a> = BTreeMap<TurnLabel, Vec<&'a ActivationSnapshot>>;

/// Computes [`FeatureStat`]s from labels and snapshots.
#[derive(Debug, Default, Clone)]
pub struct FeatureDiffAnalyzer;

impl FeatureDiffAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Aggregate every feature seen in the snapshot of any resolved turn.
    pub fn analyze(&self, labels: &[ValidationLabel], corpus: &LogCorpus) -> FeatureDiffReport {
        let mut groups: LabelGroups = TurnLabel::TERMINAL.iter().map(|&l| (l, Vec::new())).collect();
        let mut excluded_unresolved = 0;
        let mut missing_snapshots = 0;

        for label in labels {
            if !label.label.is_terminal() {
                excluded_unresolved += 1;
                continue;
            }
            let Some(snapshot) = corpus.snapshot(&label.turn_id) else {
                missing_snapshots += 1;
                continue;
            };
            groups.entry(label.label).or_default().push(snapshot);
        }
        if missing_snapshots > 0 {
            warn!("{missing_snapshots} labelled turns have no activation snapshot");
        }

        let n_by_label: BTreeMap<TurnLabel, usize> =
            groups.iter().map(|(&l, g)| (l, g.len())).collect();
        let n_confabulation = n_by_label
            .get(&TurnLabel::Confabulation)
            .copied()
            .unwrap_or(0);
        let n_honest = honest_snapshots(&groups).len();
        info!(
            "Comparing {} confabulated vs {} honest turns ({} unresolved excluded)",
            n_confabulation, n_honest, excluded_unresolved
        );

        let features: BTreeSet<usize> = groups
            .values()
            .flatten()
            .flat_map(|s| s.decoded_features.iter().map(|f| f.index))
            .collect();

        let mut stats: Vec<FeatureStat> = features
            .into_iter()
            .map(|feature| feature_stat(feature, &groups))
            .collect();
        stats.sort_by(|a, b| {
            b.specificity_score
                .total_cmp(&a.specificity_score)
                .then(a.feature_index.cmp(&b.feature_index))
        });

        FeatureDiffReport {
            n_by_label,
            n_confabulation,
            n_honest,
            excluded_unresolved,
            missing_snapshots,
            stats,
        }
    }
}

fn honest_snapshots<'a>(groups: &LabelGroups<'a>) -> Vec<&'a ActivationSnapshot> {
    groups
        .iter()
        .filter(|(l, _)| l.is_honest())
        .flat_map(|(_, g)| g.iter().copied())
        .collect()
}

fn activation_of(snapshot: &ActivationSnapshot, feature: usize) -> f64 {
    snapshot
        .decoded_features
        .iter()
        .find(|f| f.index == feature)
        .map_or(0.0, |f| f64::from(f.activation))
}

fn rate(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

fn presence(snapshots: &[&ActivationSnapshot], feature: usize) -> usize {
    snapshots.iter().filter(|s| s.contains_feature(feature)).count()
}

fn feature_stat(feature: usize, groups: &LabelGroups) -> FeatureStat {
    let mut count_by_label = BTreeMap::new();
    let mut mean_activation_by_label = BTreeMap::new();
    for (&label, group) in groups {
        let values: Vec<f64> = group.iter().map(|s| activation_of(s, feature)).collect();
        count_by_label.insert(label, presence(group, feature));
        mean_activation_by_label.insert(label, mean_std(&values).0);
    }

    let confab: &[&ActivationSnapshot] = groups
        .get(&TurnLabel::Confabulation)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let honest = honest_snapshots(groups);
    let p_confab = rate(presence(confab, feature), confab.len());
    let p_honest = rate(presence(&honest, feature), honest.len());

    let (t_statistic, p_value) = if confab.len() >= 2 && honest.len() >= 2 {
        let confab_values: Vec<f64> = confab.iter().map(|s| activation_of(s, feature)).collect();
        let honest_values: Vec<f64> = honest.iter().map(|s| activation_of(s, feature)).collect();
        let (mean_c, std_c) = mean_std(&confab_values);
        let (mean_h, std_h) = mean_std(&honest_values);
        let (t, p) = welch_t_test(mean_c, std_c, confab.len(), mean_h, std_h, honest.len());
        (Some(t), Some(p))
    } else {
        (None, None)
    };

    FeatureStat {
        feature_index: feature,
        count_by_label,
        mean_activation_by_label,
        p_confab,
        p_honest,
        specificity_score: p_confab - p_honest,
        t_statistic,
        p_value,
        description: None,
    }
}

/// Mean and sample standard deviation.
fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len();
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    if n < 2 {
        return (mean, 0.0);
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    (mean, var.sqrt())
}

/// Welch's t-test, returns `(t, two-sided p)`.
fn welch_t_test(mean1: f64, std1: f64, n1: usize, mean2: f64, std2: f64, n2: usize) -> (f64, f64) {
    let n1_f = n1 as f64;
    let n2_f = n2 as f64;

    let se1 = std1.powi(2) / n1_f;
    let se2 = std2.powi(2) / n2_f;
    let se_diff = (se1 + se2).sqrt();

    let t = if se_diff > 0.0 {
        (mean1 - mean2) / se_diff
    } else {
        0.0
    };

    let df = if se1 > 0.0 && se2 > 0.0 {
        let numerator = (se1 + se2).powi(2);
        let denominator = (se1.powi(2) / (n1_f - 1.0)) + (se2.powi(2) / (n2_f - 1.0));
        numerator / denominator
    } else {
        n1_f + n2_f - 2.0
    };

    let p_value = match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) if df > 0.0 => 2.0 * (1.0 - dist.cdf(t.abs())),
        _ => 1.0,
    };
    (t, p_value)
}

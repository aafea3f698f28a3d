use serde::{Deserialize, Serialize};

use crate::{BasicHotRule, LowFanHotRule, RuleMode, RuleSet, VideoItem};

/// Engagement ratios derived from raw counters. Zero denominators yield 0.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DerivedRates {
    pub fav_rate: f64,
    pub coin_rate: f64,
    pub reply_rate: f64,
    pub fav_fan_ratio: f64,
}

impl DerivedRates {
    pub fn from_item(item: &VideoItem) -> Self {
        let stats = &item.stats;
        Self {
            fav_rate: ratio(stats.fav, stats.views),
            coin_rate: ratio(stats.coin, stats.views),
            reply_rate: ratio(stats.reply, stats.views),
            fav_fan_ratio: ratio(stats.fav, item.follower_count),
        }
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TagResult {
    pub is_hit: bool,
    /// Conditions that held, e.g. `views>=100000`.
    #[serde(default)]
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub basic_hot: TagResult,
    pub low_fan_hot: TagResult,
    pub rates: DerivedRates,
}

/// Evaluates both tags independently. No I/O, no shared state.
pub fn classify(item: &VideoItem, rules: &RuleSet) -> ClassificationResult {
    let rates = DerivedRates::from_item(item);
    ClassificationResult {
        basic_hot: basic_hot(item, &rules.basic_hot),
        low_fan_hot: low_fan_hot(item, &rates, &rules.low_fan_hot),
        rates,
    }
}

fn basic_hot(item: &VideoItem, rule: &BasicHotRule) -> TagResult {
    if !rule.enabled {
        return TagResult::default();
    }
    let t = &rule.thresholds;
    let s = &item.stats;
    let reasons: Vec<String> = [
        ("views", s.views, t.views),
        ("fav", s.fav, t.fav),
        ("coin", s.coin, t.coin),
        ("reply", s.reply, t.reply),
    ]
    .into_iter()
    .filter(|(_, value, threshold)| value >= threshold)
    .map(|(field, _, threshold)| format!("{field}>={threshold}"))
    .collect();

    let is_hit = match rule.mode {
        RuleMode::Any => !reasons.is_empty(),
    };
    TagResult { is_hit, reasons }
}

fn low_fan_hot(item: &VideoItem, rates: &DerivedRates, rule: &LowFanHotRule) -> TagResult {
    if !rule.enabled {
        return TagResult::default();
    }
    let checks = [
        (
            item.follower_count <= rule.fan_max,
            format!("followers<={}", rule.fan_max),
        ),
        (
            item.stats.views >= rule.views_min,
            format!("views>={}", rule.views_min),
        ),
        (
            rates.fav_rate >= rule.fav_rate,
            format!("fav_rate>={}", rule.fav_rate),
        ),
        (
            rates.coin_rate >= rule.coin_rate,
            format!("coin_rate>={}", rule.coin_rate),
        ),
        (
            rates.reply_rate >= rule.reply_rate,
            format!("reply_rate>={}", rule.reply_rate),
        ),
        (
            rates.fav_fan_ratio >= rule.fav_fan_ratio,
            format!("fav_fan_ratio>={}", rule.fav_fan_ratio),
        ),
    ];
    if checks.iter().all(|(ok, _)| *ok) {
        TagResult {
            is_hit: true,
            reasons: checks.into_iter().map(|(_, reason)| reason).collect(),
        }
    } else {
        TagResult::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Thresholds, VideoStats};

    fn item(views: u64, fav: u64, coin: u64, reply: u64, followers: u64) -> VideoItem {
        VideoItem {
            stats: VideoStats {
                views,
                fav,
                coin,
                reply,
                ..Default::default()
            },
            follower_count: followers,
        }
    }

    fn low_fan_rules() -> RuleSet {
        RuleSet {
            low_fan_hot: LowFanHotRule {
                fan_max: 50_000,
                views_min: 30_000,
                fav_rate: 0.012,
                coin_rate: 0.0025,
                reply_rate: 0.002,
                fav_fan_ratio: 0.02,
                ..LowFanHotRule::default()
            },
            ..RuleSet::default()
        }
    }

    #[test]
    fn basic_hot_any_single_threshold_is_enough() {
        let rules = RuleSet {
            basic_hot: BasicHotRule {
                thresholds: Thresholds {
                    views: 100_000,
                    fav: 1_500,
                    coin: 500,
                    reply: 200,
                },
                ..BasicHotRule::default()
            },
            ..RuleSet::default()
        };
        let out = classify(&item(50_000, 1_600, 0, 0, 10), &rules);
        assert!(out.basic_hot.is_hit);
        assert_eq!(out.basic_hot.reasons, vec!["fav>=1500".to_string()]);

        let out = classify(&item(50_000, 1_400, 0, 0, 10), &rules);
        assert!(!out.basic_hot.is_hit);
    }

    #[test]
    fn zero_threshold_is_satisfied_not_disabled() {
        let rules = RuleSet {
            basic_hot: BasicHotRule {
                thresholds: Thresholds {
                    views: u64::MAX,
                    fav: u64::MAX,
                    coin: 0,
                    reply: u64::MAX,
                },
                ..BasicHotRule::default()
            },
            ..RuleSet::default()
        };
        assert!(classify(&item(0, 0, 0, 0, 0), &rules).basic_hot.is_hit);
    }

    #[test]
    fn disabled_rules_never_hit() {
        let mut rules = RuleSet::default();
        rules.basic_hot.enabled = false;
        rules.low_fan_hot.enabled = false;
        let out = classify(&item(10_000_000, 900_000, 90_000, 90_000, 1), &rules);
        assert!(!out.basic_hot.is_hit);
        assert!(!out.low_fan_hot.is_hit);
    }

    #[test]
    fn low_fan_hot_requires_every_condition() {
        let rules = low_fan_rules();
        let miss = classify(&item(35_000, 500, 100, 80, 40_000), &rules);
        assert!(miss.rates.fav_rate > 0.012);
        assert!(miss.rates.coin_rate > 0.0025);
        assert!(miss.rates.reply_rate > 0.002);
        assert!((miss.rates.fav_fan_ratio - 0.0125).abs() < 1e-9);
        assert!(!miss.low_fan_hot.is_hit);
        assert!(miss.low_fan_hot.reasons.is_empty());

        let hit = classify(&item(35_000, 800, 100, 80, 40_000), &rules);
        assert!(hit.low_fan_hot.is_hit);
        assert_eq!(hit.low_fan_hot.reasons.len(), 6);
    }

    #[test]
    fn zero_denominators_give_zero_rates() {
        let rates = DerivedRates::from_item(&item(0, 10, 10, 10, 0));
        assert_eq!(rates, DerivedRates::default());
        assert!(!rates.fav_rate.is_nan());
    }

    #[test]
    fn classification_is_deterministic() {
        let rules = low_fan_rules();
        let video = item(35_000, 800, 100, 80, 40_000);
        assert_eq!(classify(&video, &rules), classify(&video, &rules));
    }
}

//! Core domain model for the radar: tasks, runs, rule presets, alerts and the
//! classification engine that tags videos as basic-hot / low-fan-hot.

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod classify;

pub use classify::{classify, ClassificationResult, DerivedRates, TagResult};

pub const CRATE_NAME: &str = "radar-core";

/// Upper bound on stored `error_detail` entries per run.
pub const MAX_ERROR_DETAIL: usize = 50;

/// Malformed task, template or settings configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Enabled,
    Disabled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchSort {
    #[default]
    Relevance,
    New,
    Views,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub days_limit: u32,
    pub fetch_limit: u32,
    #[serde(default)]
    pub search_sort: SearchSort,
    #[serde(default)]
    pub partition_ids: Vec<u32>,
}

impl Default for Scope {
    fn default() -> Self {
        Self {
            days_limit: 30,
            fetch_limit: 200,
            search_sort: SearchSort::Relevance,
            partition_ids: Vec::new(),
        }
    }
}

impl Scope {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(1..=3650).contains(&self.days_limit) {
            return Err(ValidationError::new(
                "scope.days_limit",
                "must be between 1 and 3650",
            ));
        }
        if !(1..=1000).contains(&self.fetch_limit) {
            return Err(ValidationError::new(
                "scope.fetch_limit",
                "must be between 1 and 1000",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    #[default]
    Daily,
}

/// Daily wall-clock trigger, interpreted in the schedule's own timezone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(rename = "type", default)]
    pub kind: ScheduleKind,
    pub time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            kind: ScheduleKind::Daily,
            time: "09:00".to_string(),
            timezone: None,
        }
    }
}

impl Schedule {
    pub fn daily_time(&self) -> Result<NaiveTime, ValidationError> {
        NaiveTime::parse_from_str(self.time.trim(), "%H:%M").map_err(|_| {
            ValidationError::new(
                "schedule.time",
                format!("`{}` is not a HH:MM wall-clock time", self.time),
            )
        })
    }

    /// Resolves the schedule timezone, falling back to `default_tz` when unset.
    pub fn resolve_tz(&self, default_tz: Tz) -> Result<Tz, ValidationError> {
        match self.timezone.as_deref().map(str::trim) {
            None | Some("") => Ok(default_tz),
            Some(name) => name.parse::<Tz>().map_err(|_| {
                ValidationError::new("schedule.timezone", format!("unknown timezone `{name}`"))
            }),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.daily_time()?;
        self.resolve_tz(Tz::UTC)?;
        Ok(())
    }
}

/// Combination mode for basic-hot thresholds. Only `any` is implemented;
/// anything else is rejected instead of silently defaulting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RuleMode {
    #[default]
    Any,
}

impl TryFrom<String> for RuleMode {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim() {
            "any" => Ok(Self::Any),
            "all" => Err(ValidationError::new(
                "rules.basic_hot.mode",
                "mode `all` is reserved and not supported yet",
            )),
            other => Err(ValidationError::new(
                "rules.basic_hot.mode",
                format!("unknown mode `{other}`"),
            )),
        }
    }
}

impl From<RuleMode> for String {
    fn from(value: RuleMode) -> Self {
        match value {
            RuleMode::Any => "any".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default)]
    pub views: u64,
    #[serde(default)]
    pub fav: u64,
    #[serde(default)]
    pub coin: u64,
    #[serde(default)]
    pub reply: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicHotRule {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: RuleMode,
    pub thresholds: Thresholds,
}

impl Default for BasicHotRule {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: RuleMode::Any,
            thresholds: Thresholds {
                views: 100_000,
                fav: 1_500,
                coin: 500,
                reply: 200,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strength {
    Light,
    #[default]
    Balanced,
    Strong,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowFanHotRule {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub strength: Strength,
    pub fan_max: u64,
    pub views_min: u64,
    pub fav_rate: f64,
    pub coin_rate: f64,
    pub reply_rate: f64,
    pub fav_fan_ratio: f64,
    #[serde(default = "default_window_days")]
    pub window_days: u32,
}

fn default_window_days() -> u32 {
    7
}

impl Default for LowFanHotRule {
    fn default() -> Self {
        Self::preset(Strength::Balanced)
    }
}

impl LowFanHotRule {
    /// Stock thresholds per strength level.
    pub fn preset(strength: Strength) -> Self {
        let (fan_max, views_min, fav_rate, coin_rate, reply_rate, fav_fan_ratio) = match strength {
            Strength::Light => (80_000, 20_000, 0.008, 0.0015, 0.0015, 0.015),
            Strength::Balanced => (50_000, 30_000, 0.012, 0.0025, 0.0020, 0.02),
            Strength::Strong => (30_000, 50_000, 0.015, 0.0035, 0.0025, 0.03),
        };
        Self {
            enabled: true,
            strength,
            fan_max,
            views_min,
            fav_rate,
            coin_rate,
            reply_rate,
            fav_fan_ratio,
            window_days: default_window_days(),
        }
    }
}

/// Rule set embedded by value in tasks and templates.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub basic_hot: BasicHotRule,
    #[serde(default)]
    pub low_fan_hot: LowFanHotRule,
}

impl RuleSet {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let low = &self.low_fan_hot;
        for (field, value) in [
            ("rules.low_fan_hot.fav_rate", low.fav_rate),
            ("rules.low_fan_hot.coin_rate", low.coin_rate),
            ("rules.low_fan_hot.reply_rate", low.reply_rate),
            ("rules.low_fan_hot.fav_fan_ratio", low.fav_fan_ratio),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ValidationError::new(
                    field,
                    "must be a finite, non-negative number",
                ));
            }
        }
        if low.window_days == 0 {
            return Err(ValidationError::new(
                "rules.low_fan_hot.window_days",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VideoStats {
    #[serde(default)]
    pub views: u64,
    #[serde(default)]
    pub like: u64,
    #[serde(default)]
    pub fav: u64,
    #[serde(default)]
    pub coin: u64,
    #[serde(default)]
    pub reply: u64,
    #[serde(default)]
    pub share: u64,
}

/// Classification input: raw counters plus the uploader's follower count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VideoItem {
    pub stats: VideoStats,
    pub follower_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub keywords: Vec<String>,
    pub exclude_words: Vec<String>,
    pub tags: Vec<String>,
    pub scope: Scope,
    pub schedule: Schedule,
    pub rules: RuleSet,
    pub status: TaskStatus,
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn is_enabled(&self) -> bool {
        self.status == TaskStatus::Enabled
    }

    /// Editable view of the task, e.g. as the target of a template apply.
    pub fn to_draft(&self) -> TaskDraft {
        TaskDraft {
            name: self.name.clone(),
            keywords: self.keywords.clone(),
            exclude_words: self.exclude_words.clone(),
            tags: self.tags.clone(),
            scope: self.scope.clone(),
            schedule: self.schedule.clone(),
            rules: self.rules.clone(),
        }
    }
}

/// Create payload; also the unit a template is applied to.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskDraft {
    pub name: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub exclude_words: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub rules: RuleSet,
}

impl TaskDraft {
    /// Trims and de-duplicates word lists, then validates every section.
    pub fn normalized(mut self) -> Result<Self, ValidationError> {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return Err(ValidationError::new("name", "cannot be empty"));
        }
        if self.name.chars().count() > 200 {
            return Err(ValidationError::new("name", "longer than 200 characters"));
        }
        self.keywords = clean_words(self.keywords);
        if self.keywords.is_empty() {
            return Err(ValidationError::new("keywords", "cannot be empty"));
        }
        self.exclude_words = clean_words(self.exclude_words);
        self.tags = clean_words(self.tags);
        self.scope.validate()?;
        self.schedule.validate()?;
        self.rules.validate()?;
        Ok(self)
    }

    pub fn into_task(self, now: DateTime<Utc>) -> Task {
        Task {
            id: Uuid::new_v4(),
            name: self.name,
            keywords: self.keywords,
            exclude_words: self.exclude_words,
            tags: self.tags,
            scope: self.scope,
            schedule: self.schedule,
            rules: self.rules,
            status: TaskStatus::Enabled,
            consecutive_failures: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update; absent fields keep their current value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    pub name: Option<String>,
    pub keywords: Option<Vec<String>>,
    pub exclude_words: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub scope: Option<Scope>,
    pub schedule: Option<Schedule>,
    pub rules: Option<RuleSet>,
    pub status: Option<TaskStatus>,
}

impl TaskPatch {
    /// Applies the patch to a copy of `task` and re-validates the result.
    pub fn apply(self, task: &Task, now: DateTime<Utc>) -> Result<Task, ValidationError> {
        let mut draft = task.to_draft();
        if let Some(name) = self.name {
            draft.name = name;
        }
        if let Some(keywords) = self.keywords {
            draft.keywords = keywords;
        }
        if let Some(exclude_words) = self.exclude_words {
            draft.exclude_words = exclude_words;
        }
        if let Some(tags) = self.tags {
            draft.tags = tags;
        }
        if let Some(scope) = self.scope {
            draft.scope = scope;
        }
        if let Some(schedule) = self.schedule {
            draft.schedule = schedule;
        }
        if let Some(rules) = self.rules {
            draft.rules = rules;
        }
        let draft = draft.normalized()?;
        Ok(Task {
            id: task.id,
            name: draft.name,
            keywords: draft.keywords,
            exclude_words: draft.exclude_words,
            tags: draft.tags,
            scope: draft.scope,
            schedule: draft.schedule,
            rules: draft.rules,
            status: self.status.unwrap_or(task.status),
            consecutive_failures: task.consecutive_failures,
            created_at: task.created_at,
            updated_at: now,
        })
    }
}

fn clean_words(words: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(words.len());
    for word in words {
        let word = word.trim();
        if !word.is_empty() && !out.iter().any(|w| w == word) {
            out.push(word.to_string());
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
    Schedule,
    Manual,
    Retry,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::Manual => "manual",
            Self::Retry => "retry",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunCounts {
    pub fetched: u32,
    pub deduped: u32,
    pub inserted: u32,
    pub basic_hot: u32,
    pub low_fan_hot: u32,
    pub failed_items: u32,
    #[serde(default)]
    pub excluded: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStage {
    Search,
    Detail,
    Classify,
    Persist,
    Run,
}

/// One structured failure; `context` keeps insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub stage: ErrorStage,
    pub message: String,
    #[serde(default)]
    pub context: Vec<(String, String)>,
}

impl ErrorEntry {
    pub fn new(stage: ErrorStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            context: Vec::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub task_id: Uuid,
    pub trigger: RunTrigger,
    pub status: RunStatus,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub counts: RunCounts,
    pub error_summary: Option<String>,
    pub error_detail: Vec<ErrorEntry>,
    /// Lookup-only reference to the run this one retries.
    pub retry_of: Option<Uuid>,
}

impl RunRecord {
    pub fn start(
        task_id: Uuid,
        trigger: RunTrigger,
        retry_of: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            trigger,
            status: RunStatus::Running,
            start_at: now,
            end_at: None,
            duration_ms: None,
            counts: RunCounts::default(),
            error_summary: None,
            error_detail: Vec::new(),
            retry_of,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub name: String,
    pub industry: String,
    pub strength: Strength,
    pub rules: RuleSet,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Template {
    /// Copies this template's rules into `draft`. Nothing links the two afterwards.
    pub fn apply_to(&self, draft: &mut TaskDraft) {
        draft.rules = self.rules.clone();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateDraft {
    pub name: String,
    #[serde(default = "default_industry")]
    pub industry: String,
    #[serde(default)]
    pub strength: Strength,
    #[serde(default)]
    pub rules: RuleSet,
}

fn default_industry() -> String {
    "other".to_string()
}

impl TemplateDraft {
    pub fn normalized(mut self) -> Result<Self, ValidationError> {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return Err(ValidationError::new("name", "cannot be empty"));
        }
        self.industry = self.industry.trim().to_string();
        if self.industry.is_empty() {
            self.industry = default_industry();
        }
        self.rules.validate()?;
        Ok(self)
    }

    pub fn into_template(self, now: DateTime<Utc>) -> Template {
        Template {
            id: Uuid::new_v4(),
            name: self.name,
            industry: self.industry,
            strength: self.strength,
            rules: self.rules,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TemplatePatch {
    pub name: Option<String>,
    pub industry: Option<String>,
    pub strength: Option<Strength>,
    pub rules: Option<RuleSet>,
}

impl TemplatePatch {
    pub fn apply(self, template: &Template, now: DateTime<Utc>) -> Result<Template, ValidationError> {
        let draft = TemplateDraft {
            name: self.name.unwrap_or_else(|| template.name.clone()),
            industry: self.industry.unwrap_or_else(|| template.industry.clone()),
            strength: self.strength.unwrap_or(template.strength),
            rules: self.rules.unwrap_or_else(|| template.rules.clone()),
        }
        .normalized()?;
        Ok(Template {
            id: template.id,
            name: draft.name,
            industry: draft.industry,
            strength: draft.strength,
            rules: draft.rules,
            created_at: template.created_at,
            updated_at: now,
        })
    }
}

/// Built-in industry presets used to seed an empty template store.
pub fn preset_templates() -> Vec<TemplateDraft> {
    let mut out = Vec::with_capacity(6);
    for (industry, label) in [("appliance", "Appliance"), ("3c", "3C")] {
        for (strength, level) in [
            (Strength::Light, "light"),
            (Strength::Balanced, "balanced"),
            (Strength::Strong, "strong"),
        ] {
            out.push(TemplateDraft {
                name: format!("{label} low-fan hot ({level})"),
                industry: industry.to_string(),
                strength,
                rules: RuleSet {
                    basic_hot: BasicHotRule::default(),
                    low_fan_hot: LowFanHotRule::preset(strength),
                },
            });
        }
    }
    out
}

/// Upper bound on the shared fetch rate.
pub const MAX_RATE_LIMIT_PER_SEC: u32 = 1000;

/// Process-wide runtime settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub rate_limit_per_sec: u32,
    pub retry_times: u32,
    pub timeout_seconds: u64,
    pub alert_consecutive_failures: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rate_limit_per_sec: 1,
            retry_times: 2,
            timeout_seconds: 10,
            alert_consecutive_failures: 3,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(1..=MAX_RATE_LIMIT_PER_SEC).contains(&self.rate_limit_per_sec) {
            return Err(ValidationError::new(
                "rate_limit_per_sec",
                format!("must be between 1 and {MAX_RATE_LIMIT_PER_SEC}"),
            ));
        }
        if self.retry_times > 10 {
            return Err(ValidationError::new("retry_times", "must be at most 10"));
        }
        if self.timeout_seconds == 0 {
            return Err(ValidationError::new("timeout_seconds", "must be at least 1"));
        }
        if self.alert_consecutive_failures == 0 {
            return Err(ValidationError::new(
                "alert_consecutive_failures",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SettingsPatch {
    pub rate_limit_per_sec: Option<u32>,
    pub retry_times: Option<u32>,
    pub timeout_seconds: Option<u64>,
    pub alert_consecutive_failures: Option<u32>,
}

impl SettingsPatch {
    pub fn apply(self, current: Settings) -> Result<Settings, ValidationError> {
        let next = Settings {
            rate_limit_per_sec: self.rate_limit_per_sec.unwrap_or(current.rate_limit_per_sec),
            retry_times: self.retry_times.unwrap_or(current.retry_times),
            timeout_seconds: self.timeout_seconds.unwrap_or(current.timeout_seconds),
            alert_consecutive_failures: self
                .alert_consecutive_failures
                .unwrap_or(current.alert_consecutive_failures),
        };
        next.validate()?;
        Ok(next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ConsecutiveFailure,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConsecutiveFailure => "consecutive_failure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub task_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
    pub meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

impl Alert {
    /// Sets `read_at` once; later calls leave the first timestamp in place.
    pub fn mark_read(&mut self, now: DateTime<Utc>) -> bool {
        if self.read_at.is_some() {
            return false;
        }
        self.read_at = Some(now);
        true
    }
}

/// Operator triage state of a stored video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    #[default]
    Todo,
    Done,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::Done => "done",
        }
    }
}

/// Hot tag a video listing can be narrowed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotTag {
    BasicHot,
    LowFanHot,
}

/// Video listing order. Every key sorts descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoSort {
    Views,
    Fav,
    Coin,
    Reply,
    FavRate,
    CoinRate,
    ReplyRate,
    FavFanRatio,
    PublishTime,
    #[default]
    FetchTime,
}

/// Trims a video note; blank notes clear it.
pub fn normalize_note(note: Option<String>) -> Option<String> {
    note.map(|n| n.trim().to_string()).filter(|n| !n.is_empty())
}

/// Persisted video row with the tag results of its latest classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub bvid: String,
    pub title: String,
    pub up_id: String,
    pub up_name: String,
    pub follower_count: u64,
    pub publish_time: Option<DateTime<Utc>>,
    pub cover_url: Option<String>,
    pub stats: VideoStats,
    pub rates: DerivedRates,
    pub basic_hot: TagResult,
    pub low_fan_hot: TagResult,
    pub tags: Vec<String>,
    pub source_task_ids: Vec<Uuid>,
    pub fetch_time: DateTime<Utc>,
    /// Operator-owned; refetches keep the stored value.
    #[serde(default)]
    pub process_status: ProcessStatus,
    #[serde(default)]
    pub note: Option<String>,
}

impl VideoRecord {
    pub fn has_tag(&self, tag: HotTag) -> bool {
        match tag {
            HotTag::BasicHot => self.basic_hot.is_hit,
            HotTag::LowFanHot => self.low_fan_hot.is_hit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 20,
        }
    }
}

impl PageRequest {
    pub fn new(page: Option<u32>, page_size: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            page_size: page_size.unwrap_or(20).clamp(1, 100),
        }
    }

    pub fn offset(&self) -> usize {
        (self.page.max(1) as usize - 1) * self.page_size as usize
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
}

impl<T> Page<T> {
    /// Slices an already filtered, already ordered collection.
    pub fn from_vec(all: Vec<T>, req: PageRequest) -> Self {
        let total = all.len() as u64;
        let items = all
            .into_iter()
            .skip(req.offset())
            .take(req.page_size as usize)
            .collect();
        Self {
            items,
            page: req.page,
            page_size: req.page_size,
            total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn draft() -> TaskDraft {
        TaskDraft {
            name: "  kitchen gadgets ".into(),
            keywords: vec![" air fryer".into(), "".into(), "air fryer".into(), "blender".into()],
            ..Default::default()
        }
    }

    #[test]
    fn draft_normalization_trims_and_dedupes() {
        let d = draft().normalized().unwrap();
        assert_eq!(d.name, "kitchen gadgets");
        assert_eq!(d.keywords, vec!["air fryer".to_string(), "blender".to_string()]);
    }

    #[test]
    fn empty_keywords_are_rejected() {
        let err = TaskDraft {
            name: "x".into(),
            keywords: vec!["   ".into()],
            ..Default::default()
        }
        .normalized()
        .unwrap_err();
        assert_eq!(err.field, "keywords");
    }

    #[test]
    fn schedule_time_and_timezone_are_checked() {
        let mut s = Schedule::default();
        assert!(s.validate().is_ok());
        s.time = "25:61".into();
        assert_eq!(s.validate().unwrap_err().field, "schedule.time");
        s.time = "07:30".into();
        s.timezone = Some("Mars/Olympus".into());
        assert_eq!(s.validate().unwrap_err().field, "schedule.timezone");
        s.timezone = Some("Asia/Shanghai".into());
        assert_eq!(s.resolve_tz(Tz::UTC).unwrap(), chrono_tz::Asia::Shanghai);
    }

    #[test]
    fn unknown_rule_mode_is_a_validation_error() {
        let json = r#"{"mode":"all","thresholds":{"views":1}}"#;
        let err = serde_json::from_str::<BasicHotRule>(json).unwrap_err();
        assert!(err.to_string().contains("reserved"));

        let json = r#"{"mode":"most","thresholds":{"views":1}}"#;
        assert!(serde_json::from_str::<BasicHotRule>(json).is_err());

        let json = r#"{"mode":"any","thresholds":{"views":1}}"#;
        let rule: BasicHotRule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.mode, RuleMode::Any);
        assert!(rule.enabled);
    }

    #[test]
    fn negative_rates_are_rejected() {
        let mut rules = RuleSet::default();
        rules.low_fan_hot.coin_rate = -0.1;
        assert_eq!(
            rules.validate().unwrap_err().field,
            "rules.low_fan_hot.coin_rate"
        );
        rules.low_fan_hot.coin_rate = f64::NAN;
        assert!(rules.validate().is_err());
    }

    #[test]
    fn patch_keeps_identity_and_counters() {
        let now = Utc::now();
        let mut task = draft().normalized().unwrap().into_task(now);
        task.consecutive_failures = 2;
        let patched = TaskPatch {
            name: Some("renamed".into()),
            status: Some(TaskStatus::Disabled),
            ..Default::default()
        }
        .apply(&task, now)
        .unwrap();
        assert_eq!(patched.id, task.id);
        assert_eq!(patched.name, "renamed");
        assert_eq!(patched.status, TaskStatus::Disabled);
        assert_eq!(patched.consecutive_failures, 2);
        assert_eq!(patched.keywords, task.keywords);
    }

    #[test]
    fn template_apply_copies_rules_by_value() {
        let now = Utc::now();
        let mut template = preset_templates()
            .into_iter()
            .find(|t| t.strength == Strength::Strong)
            .unwrap()
            .into_template(now);
        let mut d = draft();
        template.apply_to(&mut d);
        assert_eq!(d.rules.low_fan_hot.fan_max, 30_000);

        template.rules.low_fan_hot.fan_max = 1;
        assert_eq!(d.rules.low_fan_hot.fan_max, 30_000);
    }

    #[test]
    fn alert_mark_read_is_idempotent() {
        let first = Utc::now();
        let mut alert = Alert {
            id: Uuid::new_v4(),
            task_id: None,
            kind: AlertKind::ConsecutiveFailure,
            level: AlertLevel::Warning,
            title: "t".into(),
            message: "m".into(),
            meta: serde_json::json!({}),
            created_at: first,
            read_at: None,
        };
        assert!(alert.mark_read(first));
        assert!(!alert.mark_read(first + chrono::Duration::seconds(5)));
        assert_eq!(alert.read_at, Some(first));
    }

    #[test]
    fn settings_bounds() {
        assert!(Settings::default().validate().is_ok());
        let err = SettingsPatch {
            rate_limit_per_sec: Some(0),
            ..Default::default()
        }
        .apply(Settings::default())
        .unwrap_err();
        assert_eq!(err.field, "rate_limit_per_sec");

        let huge = Settings {
            rate_limit_per_sec: 2_000_000_000,
            ..Settings::default()
        };
        assert_eq!(huge.validate().unwrap_err().field, "rate_limit_per_sec");
        let ceiling = Settings {
            rate_limit_per_sec: MAX_RATE_LIMIT_PER_SEC,
            ..Settings::default()
        };
        assert!(ceiling.validate().is_ok());
    }

    #[test]
    fn stored_videos_default_to_todo_without_note() {
        let raw = json!({
            "bvid": "BV1old",
            "title": "older row",
            "up_id": "7",
            "up_name": "up",
            "follower_count": 10,
            "publish_time": null,
            "cover_url": null,
            "stats": { "views": 5 },
            "rates": { "fav_rate": 0.0, "coin_rate": 0.0, "reply_rate": 0.0, "fav_fan_ratio": 0.0 },
            "basic_hot": { "is_hit": true },
            "low_fan_hot": { "is_hit": false },
            "tags": [],
            "source_task_ids": [],
            "fetch_time": "2024-05-01T00:00:00Z"
        });
        let video: VideoRecord = serde_json::from_value(raw).expect("decode");
        assert_eq!(video.process_status, ProcessStatus::Todo);
        assert_eq!(video.note, None);
        assert!(video.has_tag(HotTag::BasicHot));
        assert!(!video.has_tag(HotTag::LowFanHot));

        assert_eq!(normalize_note(Some("  call back ".into())), Some("call back".into()));
        assert_eq!(normalize_note(Some("   ".into())), None);
        let sort: VideoSort = serde_json::from_value(json!("fav_fan_ratio")).expect("sort");
        assert_eq!(sort, VideoSort::FavFanRatio);
        assert_eq!(VideoSort::default(), VideoSort::FetchTime);
    }

    #[test]
    fn page_slicing_and_clamping() {
        let req = PageRequest::new(Some(0), Some(500));
        assert_eq!(req, PageRequest { page: 1, page_size: 100 });
        let page = Page::from_vec((0..5).collect::<Vec<_>>(), PageRequest::new(Some(2), Some(2)));
        assert_eq!(page.items, vec![2, 3]);
        assert_eq!(page.total, 5);
    }
}

use crate::schedule::Schedule;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Evaluation state of a metric or a whole trigger.
///
/// States are totally ordered by severity:
/// `EXCEPTION > ERROR > NODATA > WARN > OK`.
///
/// # Examples
///
/// ```
/// use oxalert_common::types::State;
///
/// let st: State = "nodata".parse().unwrap();
/// assert_eq!(st, State::Nodata);
/// assert_eq!(st.to_string(), "NODATA");
/// assert!(State::Exception > State::Error);
/// assert!(State::Nodata > State::Warn);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum State {
    Ok,
    Warn,
    Error,
    Nodata,
    Exception,
}

impl State {
    fn severity(self) -> u8 {
        match self {
            State::Ok => 0,
            State::Warn => 1,
            State::Nodata => 2,
            State::Error => 3,
            State::Exception => 4,
        }
    }

    /// Weight used when computing a trigger score.
    pub fn score(self) -> i64 {
        match self {
            State::Ok => 0,
            State::Warn => 1,
            State::Error => 100,
            State::Nodata => 1_000,
            State::Exception => 100_000,
        }
    }

    /// States that keep reminding subscribers while they persist.
    pub fn is_remindable(self) -> bool {
        matches!(self, State::Error | State::Nodata)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Ok => "OK",
            State::Warn => "WARN",
            State::Error => "ERROR",
            State::Nodata => "NODATA",
            State::Exception => "EXCEPTION",
        }
    }
}

impl PartialOrd for State {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for State {
    fn cmp(&self, other: &Self) -> Ordering {
        self.severity().cmp(&other.severity())
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "OK" => Ok(State::Ok),
            "WARN" => Ok(State::Warn),
            "ERROR" => Ok(State::Error),
            "NODATA" => Ok(State::Nodata),
            "EXCEPTION" => Ok(State::Exception),
            _ => Err(format!("unknown state: {s}")),
        }
    }
}

/// State assigned to a metric that has been silent for longer than the
/// trigger TTL. `Del` removes the metric from check data instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TtlState {
    Ok,
    Warn,
    Error,
    #[default]
    Nodata,
    Del,
}

impl TtlState {
    /// The state a silent metric moves to, or `None` when it must be removed.
    pub fn to_state(self) -> Option<State> {
        match self {
            TtlState::Ok => Some(State::Ok),
            TtlState::Warn => Some(State::Warn),
            TtlState::Error => Some(State::Error),
            TtlState::Nodata => Some(State::Nodata),
            TtlState::Del => None,
        }
    }
}

impl FromStr for TtlState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "DEL" => Ok(TtlState::Del),
            "OK" => Ok(TtlState::Ok),
            "WARN" => Ok(TtlState::Warn),
            "ERROR" => Ok(TtlState::Error),
            "NODATA" => Ok(TtlState::Nodata),
            _ => Err(format!("unknown ttl state: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    #[default]
    Rising,
    Falling,
    Expression,
}

/// Exactly one owner per trigger, subscription or contact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Owner {
    User(String),
    Team(String),
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::User(u) => write!(f, "user:{u}"),
            Owner::Team(t) => write!(f, "team:{t}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TriggerError {
    #[error("trigger has no targets")]
    NoTargets,
    #[error("expression trigger requires a non-empty expression and no thresholds")]
    InvalidExpressionTrigger,
    #[error("{0} trigger requires warn_value or error_value")]
    MissingThresholds(&'static str),
    #[error("rising trigger requires warn_value <= error_value")]
    RisingOrder,
    #[error("falling trigger requires warn_value >= error_value")]
    FallingOrder,
    #[error("triggers with several targets must use an expression")]
    MultipleTargetsNeedExpression,
    #[error("negative ttl is not allowed")]
    NegativeTtl,
}

/// A user-authored rule mapping metric series to a state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub desc: Option<String>,
    pub targets: Vec<String>,
    #[serde(default)]
    pub warn_value: Option<f64>,
    #[serde(default)]
    pub error_value: Option<f64>,
    #[serde(default)]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Seconds of silence before a metric moves to `ttl_state`; 0 disables.
    #[serde(default = "default_ttl")]
    pub ttl: i64,
    #[serde(default)]
    pub ttl_state: TtlState,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    pub owner: Owner,
    #[serde(default)]
    pub is_remote: bool,
    #[serde(default)]
    pub mute_new_metrics: bool,
    #[serde(default)]
    pub check_interval_s: Option<u64>,
}

fn default_ttl() -> i64 {
    600
}

impl Trigger {
    pub fn validate(&self) -> Result<(), TriggerError> {
        if self.targets.is_empty() {
            return Err(TriggerError::NoTargets);
        }
        if self.ttl < 0 {
            return Err(TriggerError::NegativeTtl);
        }
        let has_expression = self
            .expression
            .as_deref()
            .is_some_and(|e| !e.trim().is_empty());
        let has_thresholds = self.warn_value.is_some() || self.error_value.is_some();

        match self.trigger_type {
            TriggerType::Expression => {
                if !has_expression || has_thresholds {
                    return Err(TriggerError::InvalidExpressionTrigger);
                }
            }
            TriggerType::Rising | TriggerType::Falling => {
                if self.targets.len() > 1 {
                    return Err(TriggerError::MultipleTargetsNeedExpression);
                }
                if !has_thresholds {
                    let kind = if self.trigger_type == TriggerType::Rising {
                        "rising"
                    } else {
                        "falling"
                    };
                    return Err(TriggerError::MissingThresholds(kind));
                }
                if let (Some(warn), Some(error)) = (self.warn_value, self.error_value) {
                    if self.trigger_type == TriggerType::Rising && warn > error {
                        return Err(TriggerError::RisingOrder);
                    }
                    if self.trigger_type == TriggerType::Falling && warn < error {
                        return Err(TriggerError::FallingOrder);
                    }
                }
            }
        }
        Ok(())
    }

    /// Metric selectors referenced by the targets, deduplicated, in target order.
    pub fn patterns(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            let pattern = target.trim();
            if !pattern.is_empty() && !out.iter().any(|p| p == pattern) {
                out.push(pattern.to_string());
            }
        }
        out
    }
}

/// Returns true for tag-style selectors (`seriesByTag(...)`).
pub fn is_tag_pattern(pattern: &str) -> bool {
    pattern.trim_start().starts_with("seriesByTag(")
}

/// Who set a maintenance window, and who cleared it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceInfo {
    #[serde(default)]
    pub started_by: Option<String>,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub stopped_by: Option<String>,
    #[serde(default)]
    pub stopped_at: Option<i64>,
}

/// A maintenance stop time with the actor who wrote it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Maintenance {
    pub until: i64,
    #[serde(default)]
    pub info: MaintenanceInfo,
}

impl Maintenance {
    /// Picks the later stop time; identical stop times resolve to the one
    /// written last.
    pub fn later<'a>(a: Option<&'a Maintenance>, b: Option<&'a Maintenance>) -> Option<&'a Maintenance> {
        match (a, b) {
            (Some(a), Some(b)) => match a.until.cmp(&b.until) {
                Ordering::Greater => Some(a),
                Ordering::Less => Some(b),
                Ordering::Equal => {
                    if a.info.started_at.unwrap_or(0) >= b.info.started_at.unwrap_or(0) {
                        Some(a)
                    } else {
                        Some(b)
                    }
                }
            },
            (a, None) => a,
            (None, b) => b,
        }
    }

    pub fn covers(&self, ts: i64) -> bool {
        ts <= self.until
    }
}

/// Last known evaluation result of one metric of a trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricState {
    pub state: State,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
    pub timestamp: i64,
    pub event_timestamp: i64,
    #[serde(default)]
    pub suppressed: bool,
    #[serde(default)]
    pub suppressed_state: Option<State>,
    #[serde(default)]
    pub maintenance: Option<Maintenance>,
}

impl MetricState {
    /// Initial state of a metric the trigger has not seen before.
    pub fn new_metric(timestamp: i64) -> Self {
        Self {
            state: State::Nodata,
            value: None,
            values: BTreeMap::new(),
            timestamp,
            event_timestamp: 0,
            suppressed: false,
            suppressed_state: None,
            maintenance: None,
        }
    }
}

/// Per-trigger evaluation results persisted between checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckData {
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricState>,
    pub state: State,
    #[serde(default)]
    pub score: i64,
    pub timestamp: i64,
    #[serde(default)]
    pub event_timestamp: i64,
    #[serde(default)]
    pub last_successful_check: i64,
    #[serde(default)]
    pub suppressed: bool,
    #[serde(default)]
    pub suppressed_state: Option<State>,
    #[serde(default)]
    pub maintenance: Option<Maintenance>,
    #[serde(default)]
    pub message: Option<String>,
}

impl CheckData {
    pub fn new() -> Self {
        Self {
            metrics: BTreeMap::new(),
            state: State::Nodata,
            score: 0,
            timestamp: 0,
            event_timestamp: 0,
            last_successful_check: 0,
            suppressed: false,
            suppressed_state: None,
            maintenance: None,
            message: None,
        }
    }

    /// Worst state across metrics, or `OK` when there are none.
    pub fn worst_metric_state(&self) -> State {
        self.metrics
            .values()
            .map(|m| m.state)
            .max()
            .unwrap_or(State::Ok)
    }

    pub fn compute_score(&self) -> i64 {
        self.state.score() + self.metrics.values().map(|m| m.state.score()).sum::<i64>()
    }
}

impl Default for CheckData {
    fn default() -> Self {
        Self::new()
    }
}

/// Extra context attached to synthetic events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventInfo {
    /// State has stayed bad for `interval_s` since the last event.
    Reminder { interval_s: i64 },
    /// A maintenance window ended; carries who set it.
    MaintenanceEnd { info: MaintenanceInfo },
}

/// A state transition emitted by the checker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub trigger_id: String,
    #[serde(default)]
    pub metric: String,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
    pub timestamp: i64,
    pub old_state: State,
    pub state: State,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub is_trigger_event: bool,
    #[serde(default)]
    pub sub_id: Option<String>,
    #[serde(default)]
    pub info: Option<EventInfo>,
    #[serde(default)]
    pub dispatch_failed: bool,
}

impl NotificationEvent {
    /// Key identifying a redelivery of the same event to the same subscription.
    pub fn dedup_key(&self, sub_id: &str) -> String {
        format!(
            "{sub_id}:{}:{}:{}:{}:{}",
            self.trigger_id, self.metric, self.old_state, self.state, self.timestamp
        )
    }

    pub fn is_recovery(&self) -> bool {
        self.state == State::Ok && self.old_state != State::Ok
    }

    /// Transitions that only move between OK and WARN.
    pub fn is_warning_only(&self) -> bool {
        let quiet = |s: State| matches!(s, State::Ok | State::Warn);
        quiet(self.old_state)
            && quiet(self.state)
            && (self.old_state == State::Warn || self.state == State::Warn)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlottingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_plot_theme")]
    pub theme: String,
}

fn default_plot_theme() -> String {
    "light".to_string()
}

impl Default for PlottingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            theme: default_plot_theme(),
        }
    }
}

/// Per `(contact, trigger)` rate limiting tiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottlingPolicy {
    #[serde(default = "default_tier1_threshold")]
    pub tier1_threshold: u32,
    #[serde(default = "default_tier2_threshold")]
    pub tier2_threshold: u32,
    #[serde(default = "default_tier1_delay_s")]
    pub tier1_delay_s: i64,
    #[serde(default = "default_tier2_delay_s")]
    pub tier2_delay_s: i64,
    #[serde(default = "default_throttle_window_s")]
    pub window_s: i64,
}

fn default_tier1_threshold() -> u32 {
    10
}

fn default_tier2_threshold() -> u32 {
    20
}

fn default_tier1_delay_s() -> i64 {
    1800
}

fn default_tier2_delay_s() -> i64 {
    3600
}

fn default_throttle_window_s() -> i64 {
    3600
}

impl Default for ThrottlingPolicy {
    fn default() -> Self {
        Self {
            tier1_threshold: default_tier1_threshold(),
            tier2_threshold: default_tier2_threshold(),
            tier1_delay_s: default_tier1_delay_s(),
            tier2_delay_s: default_tier2_delay_s(),
            window_s: default_throttle_window_s(),
        }
    }
}

/// A rule routing events, matched by tag, to contacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub owner: Owner,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub any_tags: bool,
    pub contacts: Vec<String>,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    #[serde(default = "default_true")]
    pub throttling_enabled: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub ignore_recoveries: bool,
    #[serde(default)]
    pub ignore_warnings: bool,
    #[serde(default)]
    pub plotting: PlottingConfig,
    #[serde(default)]
    pub throttling: Option<ThrottlingPolicy>,
}

fn default_true() -> bool {
    true
}

impl Subscription {
    pub fn matches_tags(&self, trigger_tags: &[String]) -> bool {
        self.any_tags || self.tags.iter().all(|t| trigger_tags.contains(t))
    }

    /// True when the transition flags of this subscription hide the event.
    pub fn ignores(&self, event: &NotificationEvent) -> bool {
        (self.ignore_recoveries && event.is_recovery())
            || (self.ignore_warnings && event.is_warning_only())
    }
}

/// An addressable destination; `contact_type` selects the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    #[serde(rename = "type")]
    pub contact_type: String,
    pub value: String,
    pub owner: Owner,
}

/// Copy of the trigger fields a notification needs, frozen at scheduling time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSnapshot {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub desc: Option<String>,
    pub targets: Vec<String>,
    #[serde(default)]
    pub warn_value: Option<f64>,
    #[serde(default)]
    pub error_value: Option<f64>,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_remote: bool,
}

impl From<&Trigger> for TriggerSnapshot {
    fn from(t: &Trigger) -> Self {
        Self {
            id: t.id.clone(),
            name: t.name.clone(),
            desc: t.desc.clone(),
            targets: t.targets.clone(),
            warn_value: t.warn_value,
            error_value: t.error_value,
            trigger_type: t.trigger_type,
            tags: t.tags.clone(),
            is_remote: t.is_remote,
        }
    }
}

/// Which throttling tier produced a scheduled notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleTier {
    #[default]
    Immediate,
    Delayed,
    Throttled,
}

impl ThrottleTier {
    pub fn as_str(self) -> &'static str {
        match self {
            ThrottleTier::Immediate => "immediate",
            ThrottleTier::Delayed => "delayed",
            ThrottleTier::Throttled => "throttled",
        }
    }
}

/// A notification waiting in the time-keyed queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledNotification {
    pub id: String,
    pub send_at: i64,
    pub contact: Contact,
    pub trigger: TriggerSnapshot,
    pub events: Vec<NotificationEvent>,
    #[serde(default)]
    pub throttled: bool,
    #[serde(default)]
    pub tier: ThrottleTier,
    #[serde(default)]
    pub fail_count: u32,
    #[serde(default)]
    pub plotting: PlottingConfig,
    #[serde(default)]
    pub sub_id: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SelfStateValue {
    #[default]
    Ok,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelfStateActor {
    #[default]
    Auto,
    Manual,
}

/// Process-wide health flag gating notification delivery.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SelfState {
    pub state: SelfStateValue,
    pub actor: SelfStateActor,
    pub updated_at: i64,
    #[serde(default)]
    pub message: Option<String>,
}

impl SelfState {
    pub fn is_ok(&self) -> bool {
        self.state == SelfStateValue::Ok
    }
}

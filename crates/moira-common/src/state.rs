use serde::{Deserialize, Serialize};

/// Check state of a trigger or of a single metric key.
///
/// Severity order used for aggregation is
/// `OK < WARN < NODATA < ERROR < EXCEPTION`. `TEST` is only carried by test
/// notifications and never takes part in aggregation.
///
/// # Examples
///
/// ```
/// use moira_common::state::State;
///
/// let state: State = "warn".parse().unwrap();
/// assert_eq!(state, State::Warn);
/// assert_eq!(state.to_string(), "WARN");
/// assert_eq!(State::aggregate([State::Ok, State::Nodata, State::Warn]), State::Nodata);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum State {
    #[default]
    Ok,
    Warn,
    Nodata,
    Error,
    Exception,
    Test,
}

impl State {
    /// Position in the aggregation order, `None` for `TEST`.
    pub fn rank(self) -> Option<u8> {
        match self {
            State::Ok => Some(0),
            State::Warn => Some(1),
            State::Nodata => Some(2),
            State::Error => Some(3),
            State::Exception => Some(4),
            State::Test => None,
        }
    }

    /// Weight used when computing a trigger score.
    pub fn score(self) -> i64 {
        match self {
            State::Ok | State::Test => 0,
            State::Warn => 1,
            State::Error => 100,
            State::Nodata => 1_000,
            State::Exception => 100_000,
        }
    }

    pub fn is_bad(self) -> bool {
        matches!(
            self,
            State::Warn | State::Nodata | State::Error | State::Exception
        )
    }

    /// Most severe state of `states`; `OK` when nothing ranks.
    pub fn aggregate<I>(states: I) -> State
    where
        I: IntoIterator<Item = State>,
    {
        states
            .into_iter()
            .filter_map(|s| s.rank().map(|r| (r, s)))
            .max_by_key(|(r, _)| *r)
            .map(|(_, s)| s)
            .unwrap_or(State::Ok)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Ok => "OK",
            State::Warn => "WARN",
            State::Nodata => "NODATA",
            State::Error => "ERROR",
            State::Exception => "EXCEPTION",
            State::Test => "TEST",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "OK" => Ok(State::Ok),
            "WARN" | "WARNING" => Ok(State::Warn),
            "NODATA" => Ok(State::Nodata),
            "ERROR" => Ok(State::Error),
            "EXCEPTION" => Ok(State::Exception),
            "TEST" => Ok(State::Test),
            _ => Err(format!("unknown state: {s}")),
        }
    }
}

/// State applied to a metric key that stopped reporting for longer than
/// the trigger TTL. `DEL` drops the key from the check data instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
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
    /// Metric state to switch to, `None` for `DEL`.
    pub fn to_metric_state(self) -> Option<State> {
        match self {
            TtlState::Ok => Some(State::Ok),
            TtlState::Warn => Some(State::Warn),
            TtlState::Error => Some(State::Error),
            TtlState::Nodata => Some(State::Nodata),
            TtlState::Del => None,
        }
    }

    /// Trigger-level state used when the whole trigger has no data.
    pub fn to_trigger_state(self) -> State {
        self.to_metric_state().unwrap_or(State::Ok)
    }
}

/// Global notifier switch shared by all notifier replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SelfState {
    #[default]
    Ok,
    Error,
}

impl std::fmt::Display for SelfState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelfState::Ok => f.write_str("OK"),
            SelfState::Error => f.write_str("ERROR"),
        }
    }
}

/// Who wrote the notifier state. An automatic `OK` never clears an `ERROR`
/// that an operator set by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateActor {
    #[default]
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NotifierState {
    pub state: SelfState,
    pub actor: StateActor,
}

impl NotifierState {
    /// Whether `actor` may move the notifier from this state to `next`.
    pub fn accepts(&self, next: SelfState, actor: StateActor) -> bool {
        !(actor == StateActor::Auto
            && next == SelfState::Ok
            && self.state == SelfState::Error
            && self.actor == StateActor::Manual)
    }
}

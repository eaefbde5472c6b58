use crate::error::{CheckError, Result};
use crate::expression::{Env, Expression};
use moira_common::state::State;
use moira_common::types::{Trigger, TriggerType};
use std::collections::HashMap;

/// How a trigger turns the values at one point into a state.
#[derive(Debug, Clone)]
pub enum Rule {
    /// Bigger is worse.
    Rising {
        warn: Option<f64>,
        error: Option<f64>,
    },
    /// Smaller is worse.
    Falling {
        warn: Option<f64>,
        error: Option<f64>,
    },
    Expression {
        expression: Expression,
        warn: Option<f64>,
        error: Option<f64>,
    },
}

impl Rule {
    pub fn from_trigger(trigger: &Trigger) -> Result<Self> {
        let (warn, error) = (trigger.warn_value, trigger.error_value);
        Ok(match trigger.trigger_type {
            TriggerType::Rising => Rule::Rising { warn, error },
            TriggerType::Falling => Rule::Falling { warn, error },
            TriggerType::Expression => {
                let text = trigger.expression.as_deref().ok_or_else(|| {
                    CheckError::InvalidTrigger(format!("trigger {} has no expression", trigger.id))
                })?;
                Rule::Expression {
                    expression: Expression::parse(text)?,
                    warn,
                    error,
                }
            }
        })
    }

    /// State for `values` (`t1`, `t2`, ...) given the metric's previous
    /// state.
    pub fn state(&self, values: &HashMap<String, f64>, prev_state: State) -> Result<State> {
        match self {
            Rule::Rising { warn, error } => Ok(threshold(values, *warn, *error, |v, t| v >= t)),
            Rule::Falling { warn, error } => Ok(threshold(values, *warn, *error, |v, t| v <= t)),
            Rule::Expression {
                expression,
                warn,
                error,
            } => expression.eval_state(&Env {
                values: Some(values),
                warn_value: *warn,
                error_value: *error,
                prev_state,
            }),
        }
    }
}

fn threshold(
    values: &HashMap<String, f64>,
    warn: Option<f64>,
    error: Option<f64>,
    reached: impl Fn(f64, f64) -> bool,
) -> State {
    let Some(&value) = values.get("t1") else {
        return State::Nodata;
    };
    if error.is_some_and(|e| reached(value, e)) {
        State::Error
    } else if warn.is_some_and(|w| reached(value, w)) {
        State::Warn
    } else {
        State::Ok
    }
}

//! Reduce heterogeneous state messages to a single scalar.

use espbridge_common::StateValue;

use crate::client::StateMessage;

type Extractor = fn(&StateMessage) -> Option<StateValue>;

/// Value fields in priority order. The first one present wins.
const EXTRACTORS: &[(&str, Extractor)] = &[
    ("state", state),
    ("position", position),
    ("current_operation", current_operation),
    ("brightness", brightness),
    ("is_closed", is_open),
    ("is_on", is_on),
];

fn state(m: &StateMessage) -> Option<StateValue> {
    m.state.clone()
}

fn position(m: &StateMessage) -> Option<StateValue> {
    m.position.map(StateValue::Number)
}

fn current_operation(m: &StateMessage) -> Option<StateValue> {
    m.current_operation.clone().map(StateValue::Text)
}

fn brightness(m: &StateMessage) -> Option<StateValue> {
    m.brightness.map(StateValue::Number)
}

// Covers report "closed"; the stored value is "open".
fn is_open(m: &StateMessage) -> Option<StateValue> {
    m.is_closed.map(|closed| StateValue::Bool(!closed))
}

fn is_on(m: &StateMessage) -> Option<StateValue> {
    m.is_on.map(StateValue::Bool)
}

/// Scalar carried by a state message, with the field it came from.
///
/// A NaN number is returned as-is; callers decide to discard it.
pub fn extract(message: &StateMessage) -> Option<(&'static str, StateValue)> {
    EXTRACTORS
        .iter()
        .find_map(|(field, extract)| extract(message).map(|v| (*field, v)))
}

/// Scalar carried by a state message.
pub fn normalize(message: &StateMessage) -> Option<StateValue> {
    extract(message).map(|(_, value)| value)
}

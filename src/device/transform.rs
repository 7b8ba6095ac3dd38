use serde_json::{Number, Value};

use super::formula::Formula;

/// Which side of the topic range a command was clamped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clamped {
    pub requested: f64,
    pub bound: Bound,
    pub value: f64,
}

/// A numeric command ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct WireCommand {
    pub value: Value,
    pub clamped: Option<Clamped>,
}

/// Rescales numbers between the device's wire representation and the
/// topic representation.
///
/// `integer` rounds results in both directions. Range bounds apply to
/// inbound commands only; a bound of `0` means "no bound".
#[derive(Debug, Clone, PartialEq)]
pub struct NumericTransform {
    pub integer: bool,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub state: Option<Formula>,
    pub command: Option<Formula>,
}

impl NumericTransform {
    pub fn new(integer: bool) -> Self {
        Self {
            integer,
            min: None,
            max: None,
            state: None,
            command: None,
        }
    }

    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min.filter(|m| *m != 0.0);
        self.max = max.filter(|m| *m != 0.0);
        self
    }

    pub fn with_formulas(mut self, state: Option<Formula>, command: Option<Formula>) -> Self {
        self.state = state;
        self.command = command;
        self
    }

    /// Wire value to topic text. Non-numeric input yields an empty string.
    pub fn to_topic(&self, wire: &Value) -> String {
        let Some(raw) = as_number(wire) else {
            return String::new();
        };
        let value = match &self.state {
            Some(formula) => formula.eval(raw),
            None => raw,
        };
        if self.integer {
            format!("{}", to_integer(value, self.state.is_some()) as i64)
        } else {
            format_float(value)
        }
    }

    /// Topic command text to wire value, clamped to the topic range.
    /// Returns `None` when the input is not a number.
    pub fn to_wire(&self, command: &str) -> Option<WireCommand> {
        let requested: f64 = command.trim().parse().ok().filter(|v: &f64| v.is_finite())?;

        let mut clamped = None;
        let mut value = requested;
        if let Some(min) = self.min.filter(|min| requested < *min) {
            value = min;
            clamped = Some(Clamped {
                requested,
                bound: Bound::Min,
                value: min,
            });
        } else if let Some(max) = self.max.filter(|max| requested > *max) {
            value = max;
            clamped = Some(Clamped {
                requested,
                bound: Bound::Max,
                value: max,
            });
        }

        if let Some(formula) = &self.command {
            value = formula.eval(value);
        }

        let value = if self.integer {
            Value::from(to_integer(value, self.command.is_some()) as i64)
        } else {
            Number::from_f64(value).map(Value::Number)?
        };
        Some(WireCommand { value, clamped })
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|v: &f64| v.is_finite())
}

// Halves round towards positive infinity.
fn round_half_up(v: f64) -> f64 {
    (v + 0.5).floor()
}

/// Formula results are rounded; raw integer values are truncated.
fn to_integer(v: f64, transformed: bool) -> f64 {
    if transformed { round_half_up(v) } else { v.trunc() }
}

fn format_float(v: f64) -> String {
    let s = format!("{v}");
    s.strip_suffix(".0").map(str::to_string).unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dimmer(scale: f64) -> NumericTransform {
        let (state, command) = super::super::schema::brightness_formulas(scale).unwrap();
        NumericTransform::new(true)
            .with_range(Some(0.0), Some(100.0))
            .with_formulas(Some(state), Some(command))
    }

    #[test]
    fn brightness_round_trips_on_255_scale() {
        let t = dimmer(255.0);
        for x in 0..=100 {
            let wire = t.to_wire(&x.to_string()).unwrap().value;
            let back: i64 = t.to_topic(&wire).parse().unwrap();
            assert!((back - x).abs() <= 1, "x={x} wire={wire} back={back}");
        }
    }

    #[test]
    fn brightness_round_trips_on_1000_scale() {
        let t = dimmer(1000.0);
        for x in 0..=100 {
            let wire = t.to_wire(&x.to_string()).unwrap().value;
            assert_eq!(wire, json!(x * 10));
            assert_eq!(t.to_topic(&wire), x.to_string());
        }
    }

    #[test]
    fn clamps_to_configured_range() {
        let t = NumericTransform::new(true).with_range(Some(154.0), Some(400.0));

        let low = t.to_wire("100").unwrap();
        assert_eq!(low.value, json!(154));
        assert_eq!(low.clamped.unwrap().bound, Bound::Min);

        let high = t.to_wire("900").unwrap();
        assert_eq!(high.value, json!(400));
        assert_eq!(
            high.clamped,
            Some(Clamped {
                requested: 900.0,
                bound: Bound::Max,
                value: 400.0
            })
        );

        assert!(t.to_wire("250").unwrap().clamped.is_none());
    }

    #[test]
    fn zero_bound_means_unbounded() {
        let t = NumericTransform::new(true).with_range(Some(0.0), Some(0.0));
        assert_eq!(t.to_wire("-20").unwrap().value, json!(-20));
        assert_eq!(t.to_wire("5000").unwrap().value, json!(5000));
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let t = NumericTransform::new(true);
        assert!(t.to_wire("bright").is_none());
        assert!(t.to_wire("").is_none());
        assert!(t.to_wire("NaN").is_none());
        assert_eq!(t.to_topic(&json!("n/a")), "");
        assert_eq!(t.to_topic(&json!(true)), "");
    }

    #[test]
    fn raw_integers_truncate_and_formulas_round() {
        let raw = NumericTransform::new(true);
        assert_eq!(raw.to_wire("22.7").unwrap().value, json!(22));
        assert_eq!(raw.to_wire("-3.9").unwrap().value, json!(-3));
        assert_eq!(raw.to_topic(&json!(22.7)), "22");

        let scaled = NumericTransform::new(true)
            .with_formulas(Some(Formula::parse("/10").unwrap()), Some(Formula::parse("*10").unwrap()));
        assert_eq!(scaled.to_wire("2.27").unwrap().value, json!(23));
        assert_eq!(scaled.to_topic(&json!(227)), "23");
    }

    #[test]
    fn float_topics_keep_fractions() {
        let t = NumericTransform::new(false)
            .with_formulas(Some(Formula::parse("/10").unwrap()), Some(Formula::parse("*10").unwrap()));
        assert_eq!(t.to_topic(&json!(215)), "21.5");
        assert_eq!(t.to_topic(&json!(200)), "20");
        assert_eq!(t.to_wire("21.5").unwrap().value, json!(215.0));
    }
}

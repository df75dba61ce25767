//! Runtime values and their arithmetic.
//!
//! Operations never fail: combinations the type checker rejects, arithmetic
//! with a null operand, and division by zero all produce [`Value::Null`].

use chrono::{NaiveDateTime, TimeDelta};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::domain::schema::DataType;
use crate::domain::temporal::{format_date, format_duration, format_float, parse_date, parse_duration};

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Date(NaiveDateTime),
    Duration(TimeDelta),
    Text(String),
    /// Running total and count for `avg`.
    Average { sum: Box<Value>, count: i64 },
    /// Collected samples for `stdev` (sample) and `stdevp` (population).
    StdDev { samples: Vec<f64>, sample: bool },
}

impl Value {
    /// Convert a raw cell to a value of the column's type. Empty cells,
    /// `null` and anything that fails to parse become null.
    pub fn from_cell(raw: &str, data_type: DataType) -> Value {
        let text = raw.trim();
        if text.is_empty() || text.eq_ignore_ascii_case("null") {
            return Value::Null;
        }
        match data_type {
            DataType::Null => Value::Null,
            DataType::Int => text.parse().map(Value::Int).unwrap_or(Value::Null),
            DataType::Float => text.parse().map(Value::Float).unwrap_or(Value::Null),
            DataType::Date => parse_date(text).map(Value::Date).unwrap_or(Value::Null),
            DataType::Duration => parse_duration(text)
                .map(Value::Duration)
                .unwrap_or(Value::Null),
            DataType::Text => Value::Text(text.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Value::Null => DataType::Null,
            Value::Int(_) => DataType::Int,
            Value::Float(_) | Value::StdDev { .. } => DataType::Float,
            Value::Date(_) => DataType::Date,
            Value::Duration(_) => DataType::Duration,
            Value::Text(_) => DataType::Text,
            Value::Average { sum, .. } => match sum.data_type() {
                DataType::Duration => DataType::Duration,
                _ => DataType::Float,
            },
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Collapse an accumulator into its final value; other values are returned as is.
    pub fn eval(&self) -> Value {
        match self {
            Value::Average { sum, count } => match sum.as_ref() {
                Value::Int(i) => Value::Float(*i as f64).div(&Value::Int(*count)),
                total => total.div(&Value::Int(*count)),
            },
            Value::StdDev { samples, sample } => std_dev(samples, *sample),
            other => other.clone(),
        }
    }

    pub fn add(&self, other: &Value) -> Value {
        use Value::*;
        match (self, other) {
            (Null, _) | (_, Null) => Null,
            (Int(a), Int(b)) => Int(a.wrapping_add(*b)),
            (Int(_) | Float(_), Int(_) | Float(_)) => numeric(self, other, |a, b| a + b),
            (Date(d), Duration(t)) | (Duration(t), Date(d)) => {
                d.checked_add_signed(*t).map(Date).unwrap_or(Null)
            }
            (Duration(a), Duration(b)) => a.checked_add(b).map(Duration).unwrap_or(Null),
            (Text(a), Text(b)) => Text(format!("{a}{b}")),
            (Text(a), b @ (Int(_) | Float(_) | Date(_) | Duration(_))) => Text(format!("{a}{b}")),
            (a @ (Int(_) | Float(_) | Date(_) | Duration(_)), Text(b)) => Text(format!("{a}{b}")),
            (Average { sum, count }, v) => Average {
                sum: Box::new(if sum.is_null() { v.clone() } else { sum.add(v) }),
                count: count + 1,
            },
            (StdDev { samples, sample }, v) => {
                let mut samples = samples.clone();
                if let Some(x) = v.as_f64() {
                    samples.push(x);
                }
                StdDev {
                    samples,
                    sample: *sample,
                }
            }
            _ => Null,
        }
    }

    pub fn sub(&self, other: &Value) -> Value {
        use Value::*;
        match (self, other) {
            (Null, _) | (_, Null) => Null,
            (Int(a), Int(b)) => Int(a.wrapping_sub(*b)),
            (Int(_) | Float(_), Int(_) | Float(_)) => numeric(self, other, |a, b| a - b),
            (Date(a), Date(b)) => Duration(a.signed_duration_since(*b)),
            (Date(d), Duration(t)) => d.checked_sub_signed(*t).map(Date).unwrap_or(Null),
            (Duration(a), Duration(b)) => a.checked_sub(b).map(Duration).unwrap_or(Null),
            _ => Null,
        }
    }

    pub fn mul(&self, other: &Value) -> Value {
        use Value::*;
        match (self, other) {
            (Null, _) | (_, Null) => Null,
            (Int(a), Int(b)) => Int(a.wrapping_mul(*b)),
            (Int(_) | Float(_), Int(_) | Float(_)) => numeric(self, other, |a, b| a * b),
            (Duration(d), n @ (Int(_) | Float(_))) | (n @ (Int(_) | Float(_)), Duration(d)) => {
                scale_duration(d, n.as_f64().unwrap_or(0.0))
            }
            _ => Null,
        }
    }

    pub fn div(&self, other: &Value) -> Value {
        use Value::*;
        if other.as_f64() == Some(0.0) {
            return Null;
        }
        match (self, other) {
            (Null, _) | (_, Null) => Null,
            (Int(a), Int(b)) => Int(a.wrapping_div(*b)),
            (Int(_) | Float(_), Int(_) | Float(_)) => numeric(self, other, |a, b| a / b),
            (Duration(d), n @ (Int(_) | Float(_))) => {
                scale_duration(d, 1.0 / n.as_f64().unwrap_or(1.0))
            }
            _ => Null,
        }
    }

    pub fn rem(&self, other: &Value) -> Value {
        match (self, other) {
            (Value::Int(_), Value::Int(0)) => Value::Null,
            (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_rem(*b)),
            _ => Value::Null,
        }
    }

    pub fn pow(&self, other: &Value) -> Value {
        use Value::*;
        match (self, other) {
            (Int(a), Int(b)) if *b >= 0 => u32::try_from(*b)
                .ok()
                .and_then(|b| a.checked_pow(b))
                .map(Int)
                .unwrap_or_else(|| Float((*a as f64).powf(*b as f64))),
            (Int(_) | Float(_), Int(_) | Float(_)) => numeric(self, other, f64::powf),
            _ => Null,
        }
    }

    pub fn negate(&self) -> Value {
        self.mul(&Value::Int(-1))
    }

    /// Equality used by `=` and `IN`: null equals null, numbers compare by value.
    pub fn equal(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Null, _) | (_, Value::Null) => false,
            _ => self.compare(other) == Some(Ordering::Equal),
        }
    }

    /// Ordering between comparable non-null values.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        use Value::*;
        match (self, other) {
            (Int(a), Int(b)) => Some(a.cmp(b)),
            (Int(_) | Float(_), Int(_) | Float(_)) => {
                let (a, b) = (self.as_f64()?, other.as_f64()?);
                a.partial_cmp(&b)
            }
            (Date(a), Date(b)) => Some(a.cmp(b)),
            (Duration(a), Duration(b)) => Some(a.cmp(b)),
            (Text(a), Text(b)) => Some(a.cmp(b)),
            (Average { .. } | StdDev { .. }, _) | (_, Average { .. } | StdDev { .. }) => {
                self.eval().compare(&other.eval())
            }
            _ => None,
        }
    }

    pub fn less(&self, other: &Value) -> bool {
        self.compare(other) == Some(Ordering::Less)
    }

    pub fn less_eq(&self, other: &Value) -> bool {
        matches!(self.compare(other), Some(Ordering::Less | Ordering::Equal))
    }

    pub fn greater(&self, other: &Value) -> bool {
        self.compare(other) == Some(Ordering::Greater)
    }

    pub fn greater_eq(&self, other: &Value) -> bool {
        matches!(self.compare(other), Some(Ordering::Greater | Ordering::Equal))
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Int(_) | Value::Float(_) => 1,
            Value::Date(_) => 2,
            Value::Duration(_) => 3,
            Value::Text(_) => 4,
            acc @ (Value::Average { .. } | Value::StdDev { .. }) => acc.eval().rank(),
        }
    }

    /// Total order for sorting, grouping and distinct: null first, then
    /// numbers, dates, durations and text. Accumulators order by their
    /// finished value.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        use Value::*;
        match (self, other) {
            (Average { .. } | StdDev { .. }, _) | (_, Average { .. } | StdDev { .. }) => {
                self.eval().total_cmp(&other.eval())
            }
            (Float(_), _) | (_, Float(_)) if self.rank() == 1 && other.rank() == 1 => {
                let (a, b) = (self.as_f64().unwrap_or(0.0), other.as_f64().unwrap_or(0.0));
                a.total_cmp(&b)
            }
            _ if self.rank() == other.rank() => {
                self.compare(other).unwrap_or(Ordering::Equal)
            }
            _ => self.rank().cmp(&other.rank()),
        }
    }

    /// Cast to the requested type, as used when a literal is coerced.
    pub fn cast(&self, target: DataType) -> Option<Value> {
        match (self, target) {
            (Value::Null, _) => Some(Value::Null),
            (Value::Int(i), DataType::Float) => Some(Value::Float(*i as f64)),
            (Value::Float(f), DataType::Int) if f.fract() == 0.0 => Some(Value::Int(*f as i64)),
            (Value::Text(t), DataType::Text) => Some(Value::Text(t.clone())),
            (v, DataType::Text) => Some(Value::Text(v.to_string())),
            (Value::Text(t), ty) => match Value::from_cell(t, ty) {
                Value::Null => None,
                v => Some(v),
            },
            (v, ty) if v.data_type() == ty => Some(v.clone()),
            _ => None,
        }
    }
}

fn numeric(a: &Value, b: &Value, op: impl Fn(f64, f64) -> f64) -> Value {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Value::Float(op(x, y)),
        _ => Value::Null,
    }
}

fn scale_duration(d: &TimeDelta, factor: f64) -> Value {
    match d.num_nanoseconds() {
        Some(n) => Value::Duration(TimeDelta::nanoseconds((n as f64 * factor) as i64)),
        None => Value::Null,
    }
}

fn std_dev(samples: &[f64], sample: bool) -> Value {
    let n = samples.len() as f64;
    let divisor = if sample { n - 1.0 } else { n };
    if samples.is_empty() || divisor <= 0.0 {
        return Value::Null;
    }
    let mean = samples.iter().sum::<f64>() / n;
    let squares: f64 = samples.iter().map(|x| (x - mean).powi(2)).sum();
    Value::Float((squares / divisor).sqrt())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => f.write_str(&format_float(*x)),
            Value::Date(d) => f.write_str(&format_date(d)),
            Value::Duration(d) => f.write_str(&format_duration(d)),
            Value::Text(s) => f.write_str(s),
            acc @ (Value::Average { .. } | Value::StdDev { .. }) => write!(f, "{}", acc.eval()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.total_cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        self.total_cmp(other)
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        if matches!(self, Value::Average { .. } | Value::StdDev { .. }) {
            return self.eval().hash(state);
        }
        self.rank().hash(state);
        match self {
            Value::Null => {}
            Value::Int(_) | Value::Float(_) => {
                let x = self.as_f64().unwrap_or(0.0);
                // -0.0 and 0.0 compare equal, so they must hash alike
                let x = if x == 0.0 { 0.0 } else { x };
                x.to_bits().hash(state);
            }
            Value::Date(d) => d.hash(state),
            Value::Duration(d) => d.hash(state),
            Value::Text(s) => s.hash(state),
            Value::Average { .. } | Value::StdDev { .. } => {}
        }
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            other => serializer.serialize_str(&other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;
    use proptest::prelude::*;

    fn date(y: i32, m: u32, d: u32) -> Value {
        Value::Date(NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(0, 0, 0).unwrap())
    }

    #[test]
    fn from_cell_trims_and_nulls() {
        assert_eq!(Value::from_cell(" 42 ", DataType::Int), Value::Int(42));
        assert!(Value::from_cell("NULL", DataType::Int).is_null());
        assert!(Value::from_cell("", DataType::Text).is_null());
        assert!(Value::from_cell("abc", DataType::Float).is_null());
        assert_eq!(
            Value::from_cell("2024-03-01", DataType::Date),
            date(2024, 3, 1)
        );
    }

    #[test]
    fn division_by_zero_is_null() {
        assert!(Value::Int(5).div(&Value::Int(0)).is_null());
        assert!(Value::Float(5.0).div(&Value::Float(0.0)).is_null());
        assert!(Value::Int(5).rem(&Value::Int(0)).is_null());
        assert!(Value::Duration(TimeDelta::hours(1)).div(&Value::Int(0)).is_null());
    }

    #[test]
    fn integer_division_truncates() {
        assert_eq!(Value::Int(7).div(&Value::Int(2)), Value::Int(3));
        assert_eq!(Value::Int(7).div(&Value::Float(2.0)), Value::Float(3.5));
    }

    #[test]
    fn mixed_numeric_arithmetic_promotes() {
        assert!(matches!(Value::Int(1).add(&Value::Float(0.5)), Value::Float(x) if x == 1.5));
        assert_eq!(Value::Int(2).pow(&Value::Int(10)), Value::Int(1024));
        assert_eq!(Value::Int(2).pow(&Value::Int(-1)), Value::Float(0.5));
    }

    #[test]
    fn null_propagates() {
        assert!(Value::Null.add(&Value::Int(1)).is_null());
        assert!(Value::Int(1).mul(&Value::Null).is_null());
    }

    #[test]
    fn date_and_duration_arithmetic() {
        let d1 = date(2024, 1, 10);
        let d0 = date(2024, 1, 1);
        let diff = d1.sub(&d0);
        assert_eq!(diff, Value::Duration(TimeDelta::days(9)));
        assert_eq!(d0.add(&diff), d1);
        assert_eq!(d1.sub(&diff), d0);
        assert_eq!(
            Value::Duration(TimeDelta::hours(2)).mul(&Value::Float(1.5)),
            Value::Duration(TimeDelta::hours(3))
        );
        assert!(d0.add(&d1).is_null());
    }

    #[test]
    fn text_concatenates() {
        assert_eq!(
            Value::Text("ab".into()).add(&Value::Text("cd".into())),
            Value::Text("abcd".into())
        );
    }

    #[test]
    fn null_comparisons() {
        assert!(Value::Null.equal(&Value::Null));
        assert!(!Value::Null.equal(&Value::Int(0)));
        assert!(!Value::Null.less(&Value::Int(0)));
        assert!(!Value::Int(0).greater_eq(&Value::Null));
    }

    #[test]
    fn total_order_puts_null_first() {
        let mut values = vec![
            Value::Text("a".into()),
            Value::Int(3),
            Value::Null,
            Value::Float(1.5),
        ];
        values.sort();
        assert!(values[0].is_null());
        assert_eq!(values[1], Value::Float(1.5));
        assert_eq!(values[2], Value::Int(3));
    }

    #[test]
    fn int_and_float_keys_agree() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(Value::Int(3));
        assert!(set.contains(&Value::Float(3.0)));
    }

    #[test]
    fn average_accumulates() {
        let acc = Value::Average {
            sum: Box::new(Value::Int(2)),
            count: 1,
        };
        let acc = acc.add(&Value::Int(5));
        assert_relative_eq!(acc.eval().as_f64().unwrap(), 3.5);
    }

    #[test]
    fn std_dev_sample_and_population() {
        let samples = vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let population = Value::StdDev {
            samples: samples.clone(),
            sample: false,
        };
        assert_relative_eq!(population.eval().as_f64().unwrap(), 2.0);
        let sample = Value::StdDev {
            samples,
            sample: true,
        };
        assert_relative_eq!(
            sample.eval().as_f64().unwrap(),
            2.138089935299395,
            epsilon = 1e-12
        );
        let single = Value::StdDev {
            samples: vec![1.0],
            sample: true,
        };
        assert!(single.eval().is_null());
    }

    #[test]
    fn accumulators_order_by_finished_value() {
        let avg = Value::Average {
            sum: Box::new(Value::Int(9)),
            count: 2,
        };
        assert_eq!(avg.total_cmp(&Value::Int(5)), Ordering::Less);
        assert_eq!(Value::Int(5).total_cmp(&avg), Ordering::Greater);
        assert_eq!(avg.total_cmp(&Value::Float(4.5)), Ordering::Equal);
        assert_eq!(avg.total_cmp(&Value::Text("a".into())), Ordering::Less);
        assert_eq!(avg.total_cmp(&Value::Null), Ordering::Greater);

        let spread = Value::StdDev {
            samples: vec![1.0, 3.0],
            sample: false,
        };
        let mut values = vec![Value::Int(2), spread, Value::Float(0.5)];
        values.sort();
        assert_eq!(values[0].to_string(), "0.5");
        assert_eq!(values[1].to_string(), "1");
        assert_eq!(values[2].to_string(), "2");
    }

    #[test]
    fn display_formats() {
        assert_eq!(Value::Null.to_string(), "");
        assert_eq!(Value::Float(2.0).to_string(), "2");
        assert_eq!(date(2024, 2, 29).to_string(), "2024-02-29 00:00:00");
        assert_eq!(Value::Duration(TimeDelta::hours(26)).to_string(), "26h0m0s");
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<i32>().prop_map(|i| Value::Int(i64::from(i))),
            (-1e6f64..1e6).prop_map(Value::Float),
            "[a-z]{0,4}".prop_map(Value::Text),
        ]
    }

    proptest! {
        #[test]
        fn total_cmp_is_antisymmetric(a in arb_value(), b in arb_value()) {
            prop_assert_eq!(a.total_cmp(&b), b.total_cmp(&a).reverse());
        }

        #[test]
        fn total_cmp_is_transitive(a in arb_value(), b in arb_value(), c in arb_value()) {
            let mut v = vec![a, b, c];
            v.sort();
            prop_assert!(v[0] <= v[1] && v[1] <= v[2] && v[0] <= v[2]);
        }
    }
}

//! Composable aggregators.
//!
//! An [`Aggregator`] is a factory of [`Accumulator`]s: one accumulator is
//! created per group, fed every row of the group, then asked to write its
//! result column(s) into the aggregate row.
//!
//! Numeric widening:
//!
//! | input            | sum     | average |
//! |------------------|---------|---------|
//! | Int, Long        | Long    | Double  |
//! | Float, Double    | Double  | Double  |
//! | Decimal          | Decimal | Decimal |
//!
//! Mixed inputs widen to the widest kind seen (Double over Decimal over
//! Long). Null cells are skipped.
//!
//! A Long sum that overflows `i64` carries on as an exact Decimal, so the
//! sum of integer input is Long, or Decimal past the `i64` range. The
//! average of integer input stays Double either way.

use rust_decimal::Decimal;
use std::cmp::Ordering;

use crate::error::{AggregationError, AggregationResult};
use crate::models::{Row, Value};

/// Factory of per-group accumulators.
pub trait Aggregator {
    /// Short name used in error messages.
    fn name(&self) -> &'static str;

    fn accumulator(&self) -> Box<dyn Accumulator>;
}

/// Running state of one aggregator over one group.
pub trait Accumulator {
    fn add(&mut self, row: &Row) -> AggregationResult<()>;

    /// Writes the result column(s) into `target`.
    fn finish(&self, target: &mut Row);
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Number {
    Long(i64),
    Double(f64),
    Decimal(Decimal),
}

impl Number {
    fn of(value: &Value) -> Option<Number> {
        match value {
            Value::Int(i) => Some(Number::Long(i64::from(*i))),
            Value::Long(l) => Some(Number::Long(*l)),
            Value::Float(f) => Some(Number::Double(f64::from(*f))),
            Value::Double(d) => Some(Number::Double(*d)),
            Value::Decimal(d) => Some(Number::Decimal(*d)),
            _ => None,
        }
    }

    fn to_f64(self) -> f64 {
        match self {
            Number::Long(l) => l as f64,
            Number::Double(d) => d,
            Number::Decimal(d) => Value::Decimal(d).as_f64().unwrap_or(f64::NAN),
        }
    }

    fn add(self, other: Number) -> Number {
        match (self, other) {
            (Number::Long(a), Number::Long(b)) => match a.checked_add(b) {
                Some(sum) => Number::Long(sum),
                None => Number::Decimal(Decimal::from(a) + Decimal::from(b)),
            },
            (Number::Double(_), _) | (_, Number::Double(_)) => {
                Number::Double(self.to_f64() + other.to_f64())
            }
            (Number::Decimal(a), Number::Decimal(b)) => decimal_add(a, b),
            (Number::Decimal(a), Number::Long(b)) | (Number::Long(b), Number::Decimal(a)) => {
                decimal_add(a, Decimal::from(b))
            }
        }
    }

    fn into_value(self) -> Value {
        match self {
            Number::Long(l) => Value::Long(l),
            Number::Double(d) => Value::Double(d),
            Number::Decimal(d) => Value::Decimal(d),
        }
    }
}

fn decimal_add(a: Decimal, b: Decimal) -> Number {
    match a.checked_add(b) {
        Some(sum) => Number::Decimal(sum),
        None => Number::Double(Number::Decimal(a).to_f64() + Number::Decimal(b).to_f64()),
    }
}

/// Reads a numeric cell; `Ok(None)` for null or missing.
fn numeric(aggregator: &str, row: &Row, column: &str) -> AggregationResult<Option<Number>> {
    let value = row.get(column);
    if value.is_null() {
        return Ok(None);
    }
    Number::of(value).map(Some).ok_or_else(|| AggregationError::NonNumeric {
        aggregator: aggregator.to_string(),
        column: column.to_string(),
        value: format!("({}) {}", value.type_name(), value),
    })
}

// =============================================================================
// Sum / Avg
// =============================================================================

/// Sum of a numeric column. An all-null group sums to null.
#[derive(Debug, Clone)]
pub struct Sum {
    column: String,
    target: String,
}

impl Sum {
    pub fn new(column: &str) -> Self {
        Self {
            column: column.to_string(),
            target: column.to_string(),
        }
    }

    /// Writes the result into `target` instead of the source column name.
    pub fn into_column(mut self, target: &str) -> Self {
        self.target = target.to_string();
        self
    }
}

impl Aggregator for Sum {
    fn name(&self) -> &'static str {
        "Sum"
    }

    fn accumulator(&self) -> Box<dyn Accumulator> {
        Box::new(SumAccumulator {
            column: self.column.clone(),
            target: self.target.clone(),
            sum: None,
            count: 0,
            decimal_input: false,
            average: false,
        })
    }
}

/// Average of a numeric column: Double, or Decimal for decimal input.
#[derive(Debug, Clone)]
pub struct Avg {
    column: String,
    target: String,
}

impl Avg {
    pub fn new(column: &str) -> Self {
        Self {
            column: column.to_string(),
            target: column.to_string(),
        }
    }

    pub fn into_column(mut self, target: &str) -> Self {
        self.target = target.to_string();
        self
    }
}

impl Aggregator for Avg {
    fn name(&self) -> &'static str {
        "Avg"
    }

    fn accumulator(&self) -> Box<dyn Accumulator> {
        Box::new(SumAccumulator {
            column: self.column.clone(),
            target: self.target.clone(),
            sum: None,
            count: 0,
            decimal_input: false,
            average: true,
        })
    }
}

struct SumAccumulator {
    column: String,
    target: String,
    sum: Option<Number>,
    count: u64,
    decimal_input: bool,
    average: bool,
}

impl Accumulator for SumAccumulator {
    fn add(&mut self, row: &Row) -> AggregationResult<()> {
        let name = if self.average { "Avg" } else { "Sum" };
        if let Some(n) = numeric(name, row, &self.column)? {
            self.decimal_input |= matches!(n, Number::Decimal(_));
            self.sum = Some(match self.sum {
                Some(sum) => sum.add(n),
                None => n,
            });
            self.count += 1;
        }
        Ok(())
    }

    fn finish(&self, target: &mut Row) {
        let value = match (self.sum, self.average) {
            (None, _) => Value::Null,
            (Some(sum), false) => sum.into_value(),
            (Some(Number::Decimal(d)), true) if self.decimal_input => {
                Value::Decimal(d / Decimal::from(self.count))
            }
            (Some(sum), true) => Value::Double(sum.to_f64() / self.count as f64),
        };
        target.set(self.target.as_str(), value);
    }
}

// =============================================================================
// Min / Max
// =============================================================================

/// Smallest value of a column (any ordered kind; numbers compare across kinds).
#[derive(Debug, Clone)]
pub struct Min {
    column: String,
    target: String,
}

/// Largest value of a column.
#[derive(Debug, Clone)]
pub struct Max {
    column: String,
    target: String,
}

macro_rules! extreme_aggregator {
    ($name:ident, $keep:expr) => {
        impl $name {
            pub fn new(column: &str) -> Self {
                Self {
                    column: column.to_string(),
                    target: column.to_string(),
                }
            }

            pub fn into_column(mut self, target: &str) -> Self {
                self.target = target.to_string();
                self
            }
        }

        impl Aggregator for $name {
            fn name(&self) -> &'static str {
                stringify!($name)
            }

            fn accumulator(&self) -> Box<dyn Accumulator> {
                Box::new(ExtremeAccumulator {
                    name: stringify!($name),
                    column: self.column.clone(),
                    target: self.target.clone(),
                    keep: $keep,
                    best: None,
                })
            }
        }
    };
}

extreme_aggregator!(Min, Ordering::Less);
extreme_aggregator!(Max, Ordering::Greater);

struct ExtremeAccumulator {
    name: &'static str,
    column: String,
    target: String,
    /// Replace the current best when the new value compares as this.
    keep: Ordering,
    best: Option<Value>,
}

impl Accumulator for ExtremeAccumulator {
    fn add(&mut self, row: &Row) -> AggregationResult<()> {
        let value = row.get(&self.column);
        if value.is_null() {
            return Ok(());
        }
        let replace = match &self.best {
            None => true,
            Some(best) => match value.compare(best) {
                Some(ordering) => ordering == self.keep,
                None => {
                    return Err(AggregationError::Incomparable {
                        aggregator: self.name.to_string(),
                        column: self.column.clone(),
                        value: format!("({}) {}", value.type_name(), value),
                    })
                }
            },
        };
        if replace {
            self.best = Some(value.clone());
        }
        Ok(())
    }

    fn finish(&self, target: &mut Row) {
        target.set(self.target.as_str(), self.best.clone().unwrap_or(Value::Null));
    }
}

// =============================================================================
// Count
// =============================================================================

/// Number of rows in the group, or of non-null cells of one column.
#[derive(Debug, Clone)]
pub struct Count {
    column: Option<String>,
    target: String,
}

impl Count {
    pub fn rows(target: &str) -> Self {
        Self {
            column: None,
            target: target.to_string(),
        }
    }

    pub fn non_null(column: &str, target: &str) -> Self {
        Self {
            column: Some(column.to_string()),
            target: target.to_string(),
        }
    }
}

impl Aggregator for Count {
    fn name(&self) -> &'static str {
        "Count"
    }

    fn accumulator(&self) -> Box<dyn Accumulator> {
        Box::new(CountAccumulator {
            column: self.column.clone(),
            target: self.target.clone(),
            count: 0,
        })
    }
}

struct CountAccumulator {
    column: Option<String>,
    target: String,
    count: i64,
}

impl Accumulator for CountAccumulator {
    fn add(&mut self, row: &Row) -> AggregationResult<()> {
        let counted = match &self.column {
            None => true,
            Some(column) => !row.get(column).is_null(),
        };
        if counted {
            self.count += 1;
        }
        Ok(())
    }

    fn finish(&self, target: &mut Row) {
        target.set(self.target.as_str(), self.count);
    }
}

// =============================================================================
// Linear regression
// =============================================================================

/// Streaming least-squares fit of `y = slope * x + intercept`.
///
/// Only the running sums are kept. A single point gives slope 0 and its own
/// y as intercept; identical x values give slope 0 and the mean y. A row
/// missing x or y leaves both result columns unset for the whole group.
#[derive(Debug, Clone)]
pub struct LinearRegression {
    x: String,
    y: String,
    slope: String,
    intercept: String,
}

impl LinearRegression {
    pub fn new(x: &str, y: &str) -> Self {
        Self {
            x: x.to_string(),
            y: y.to_string(),
            slope: format!("{}_{}_slope", y, x),
            intercept: format!("{}_{}_intercept", y, x),
        }
    }

    pub fn into_columns(mut self, slope: &str, intercept: &str) -> Self {
        self.slope = slope.to_string();
        self.intercept = intercept.to_string();
        self
    }
}

impl Aggregator for LinearRegression {
    fn name(&self) -> &'static str {
        "LinearRegression"
    }

    fn accumulator(&self) -> Box<dyn Accumulator> {
        Box::new(RegressionAccumulator {
            columns: self.clone(),
            n: 0,
            sum_x: 0.0,
            sum_y: 0.0,
            sum_xx: 0.0,
            sum_xy: 0.0,
            aborted: false,
        })
    }
}

struct RegressionAccumulator {
    columns: LinearRegression,
    n: u64,
    sum_x: f64,
    sum_y: f64,
    sum_xx: f64,
    sum_xy: f64,
    aborted: bool,
}

impl RegressionAccumulator {
    fn fit(&self) -> Option<(f64, f64)> {
        if self.aborted || self.n == 0 {
            return None;
        }
        let n = self.n as f64;
        if self.n == 1 {
            return Some((0.0, self.sum_y));
        }
        let denominator = n * self.sum_xx - self.sum_x * self.sum_x;
        if denominator == 0.0 {
            return Some((0.0, self.sum_y / n));
        }
        let slope = (n * self.sum_xy - self.sum_x * self.sum_y) / denominator;
        let intercept = (self.sum_y - slope * self.sum_x) / n;
        Some((slope, intercept))
    }
}

impl Accumulator for RegressionAccumulator {
    fn add(&mut self, row: &Row) -> AggregationResult<()> {
        if self.aborted {
            return Ok(());
        }
        let x = numeric("LinearRegression", row, &self.columns.x)?;
        let y = numeric("LinearRegression", row, &self.columns.y)?;
        let (x, y) = match (x, y) {
            (Some(x), Some(y)) => (x.to_f64(), y.to_f64()),
            _ => {
                self.aborted = true;
                return Ok(());
            }
        };
        self.n += 1;
        self.sum_x += x;
        self.sum_y += y;
        self.sum_xx += x * x;
        self.sum_xy += x * y;
        Ok(())
    }

    fn finish(&self, target: &mut Row) {
        if let Some((slope, intercept)) = self.fit() {
            target.set(self.columns.slope.as_str(), slope);
            target.set(self.columns.intercept.as_str(), intercept);
        }
    }
}

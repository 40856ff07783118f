use std::{fmt, sync::Arc};

/// The type of a metric.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MetricKind {
    /// A point-in-time measurement.
    Gauge,

    /// A delta to be added to a running total.
    Counter,
}

impl MetricKind {
    /// Returns the wire name of this kind.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Gauge => "gauge",
            Self::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The value of a metric.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MetricValue {
    /// Gauge value.
    Gauge(f64),

    /// Counter delta.
    Counter(i64),
}

impl MetricValue {
    /// Returns the kind of metric this value belongs to.
    pub const fn kind(&self) -> MetricKind {
        match self {
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Counter(_) => MetricKind::Counter,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // `f64`'s `Display` is the shortest representation that round-trips, and never uses an exponent.
        match self {
            Self::Gauge(value) => write!(f, "{}", value),
            Self::Counter(delta) => write!(f, "{}", delta),
        }
    }
}

/// A named, typed measurement.
///
/// Metrics are immutable once created. Cloning is cheap, as the name is reference counted.
#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
    name: Arc<str>,
    value: MetricValue,
}

impl Metric {
    /// Creates a gauge metric.
    pub fn gauge<N: Into<Arc<str>>>(name: N, value: f64) -> Self {
        Self {
            name: name.into(),
            value: MetricValue::Gauge(value),
        }
    }

    /// Creates a counter metric carrying the given delta.
    pub fn counter<N: Into<Arc<str>>>(name: N, delta: i64) -> Self {
        Self {
            name: name.into(),
            value: MetricValue::Counter(delta),
        }
    }

    /// Returns the name of the metric.
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Returns the kind of the metric.
    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }

    /// Returns the value of the metric.
    pub fn value(&self) -> MetricValue {
        self.value
    }

    /// Returns the gauge value, if this is a gauge.
    pub fn as_gauge(&self) -> Option<f64> {
        match self.value {
            MetricValue::Gauge(value) => Some(value),
            MetricValue::Counter(_) => None,
        }
    }

    /// Returns the counter delta, if this is a counter.
    pub fn as_counter(&self) -> Option<i64> {
        match self.value {
            MetricValue::Counter(delta) => Some(delta),
            MetricValue::Gauge(_) => None,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}={}", self.kind(), self.name, self.value)
    }
}

#[allow(unused)]
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};

use std::fmt;

use itertools::Itertools;
use serde::{ser::SerializeMap, Serializer};
use serde_derive::Serialize;

use crate::lexer::{self, parse_number, serialize_float, MetricDescriptor, MetricToken, Position};
use crate::{ErrorKind, ParseError};

pub use crate::lexer::{Label, MetricType};

#[cfg(feature = "hash_fnv")]
type HashMap<K, V> = fnv::FnvHashMap<K, V>;

#[cfg(not(feature = "hash_fnv"))]
type HashMap<K, V> = std::collections::HashMap<K, V>;

type Result<T> = std::result::Result<T, ErrorKind>;

// Suffixes that tie a sample to a histogram or summary family named by the rest of the sample
// name.  Other types never get suffix treatment.
const SUFFIXES: &[(&str, SampleKind)] = &[
    ("_bucket", SampleKind::Bucket),
    ("_sum", SampleKind::Sum),
    ("_count", SampleKind::Count),
];

/// What part of a metric a sample fills in
#[derive(Clone, Copy, Debug, PartialEq)]
enum SampleKind {
    Other,
    Bucket,
    Sum,
    Count,
}

impl SampleKind {
    fn applies_to(self, metric_type: MetricType) -> bool {
        matches!(
            (self, metric_type),
            (Self::Bucket, MetricType::Histogram)
                | (Self::Sum | Self::Count, MetricType::Histogram | MetricType::Summary)
        )
    }
}

/// Label pairs in the order they were written
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct LabelSet(Vec<Label>);

/// A MetricFamily is a collection of related (and similarly named) metrics
#[derive(Clone, Debug, Serialize)]
pub struct MetricFamily {
    pub name: String,
    pub help: Option<String>,
    pub metric_type: MetricType,
    pub metrics: Vec<Metric>,
}

/// One time series of a family
#[derive(Clone, Debug, Serialize)]
pub struct Metric {
    pub labels: LabelSet,
    pub value: MetricValue,
    /// Milliseconds since the epoch
    pub timestamp_ms: Option<i64>,
}

/// The variant always matches the owning family's [`MetricType`]
#[derive(Clone, Debug, Serialize)]
pub enum MetricValue {
    Counter(#[serde(serialize_with = "serialize_float")] f64),
    Gauge(#[serde(serialize_with = "serialize_float")] f64),
    Untyped(#[serde(serialize_with = "serialize_float")] f64),
    Info(#[serde(serialize_with = "serialize_float")] f64),
    Summary(Summary),
    Histogram(Histogram),
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct Summary {
    pub count: u64,
    #[serde(serialize_with = "serialize_float")]
    pub sum: f64,
    /// Sorted by increasing quantile
    pub quantiles: Vec<Quantile>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Quantile {
    #[serde(serialize_with = "serialize_float")]
    pub quantile: f64,
    #[serde(serialize_with = "serialize_float")]
    pub value: f64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct Histogram {
    pub count: u64,
    #[serde(serialize_with = "serialize_float")]
    pub sum: f64,
    /// Sorted by increasing upper bound, the last one is always `+Inf`
    pub buckets: Vec<Bucket>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Bucket {
    #[serde(serialize_with = "serialize_float")]
    pub upper_bound: f64,
    pub cumulative_count: u64,
}

/// Every family in an exposition, keyed by name, in the order each family was first referenced.
#[derive(Clone, Debug, Default)]
pub struct MetricFamilies {
    families: Vec<MetricFamily>,
    index: HashMap<String, usize>,
}

struct Builder {
    families: Vec<FamilyBuilder>,
    index: HashMap<String, usize>,
}

struct FamilyBuilder {
    name: String,
    help: Option<String>,
    metric_type: Option<MetricType>,
    // Counter, gauge, info and untyped samples map one to one onto metrics
    metrics: Vec<Metric>,
    // Histogram and summary samples are gathered per label set first
    series: Vec<SeriesBuilder>,
    series_index: HashMap<LabelSet, usize>,
}

struct SeriesBuilder {
    labels: LabelSet,
    timestamp: Option<i64>,
    sum: f64,
    count: Option<u64>,
    // Upper bound or quantile, paired with the sample value.  Kept sorted by the first item.
    points: Vec<(f64, f64)>,
    last_seen: Position,
}

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|label| label.name == name)
            .map(|label| label.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn remove(&mut self, name: &str) -> Option<String> {
        let index = self.0.iter().position(|label| label.name == name)?;
        Some(self.0.remove(index).value)
    }

    // Label order doesn't distinguish series
    fn series_key(&self) -> LabelSet {
        Self(self.0.iter().cloned().sorted().collect())
    }
}

impl From<Vec<Label>> for LabelSet {
    fn from(labels: Vec<Label>) -> Self {
        Self(labels)
    }
}

impl<'a> IntoIterator for &'a LabelSet {
    type Item = &'a Label;
    type IntoIter = std::slice::Iter<'a, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return Ok(());
        }

        write!(
            f,
            "{{{}}}",
            self.0
                .iter()
                .map(|label| format!("{}={:?}", label.name, label.value))
                .join(",")
        )
    }
}

impl serde::Serialize for LabelSet {
    fn serialize<S>(&self, s: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = s.serialize_map(Some(self.0.len()))?;
        for label in self.0.iter() {
            map.serialize_entry(&label.name, &label.value)?;
        }
        map.end()
    }
}

impl MetricFamilies {
    pub fn get(&self, name: &str) -> Option<&MetricFamily> {
        self.index.get(name).map(|&i| &self.families[i])
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetricFamily)> {
        self.families
            .iter()
            .map(|family| (family.name.as_str(), family))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.families.iter().map(|family| family.name.as_str())
    }

    pub fn values(&self) -> std::slice::Iter<'_, MetricFamily> {
        self.families.iter()
    }
}

impl IntoIterator for MetricFamilies {
    type Item = MetricFamily;
    type IntoIter = std::vec::IntoIter<MetricFamily>;

    fn into_iter(self) -> Self::IntoIter {
        self.families.into_iter()
    }
}

impl serde::Serialize for MetricFamilies {
    fn serialize<S>(&self, s: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = s.serialize_map(Some(self.families.len()))?;
        for family in self.families.iter() {
            map.serialize_entry(&family.name, family)?;
        }
        map.end()
    }
}

impl Builder {
    fn new() -> Self {
        Self {
            families: vec![],
            index: HashMap::default(),
        }
    }

    /// Index of the family called `name`, created if this is the first time it's been seen
    fn family(&mut self, name: &str) -> usize {
        if let Some(&index) = self.index.get(name) {
            return index;
        }

        debug!(name, "new family");
        self.families.push(FamilyBuilder::new(name));
        self.index.insert(name.to_string(), self.families.len() - 1);
        self.families.len() - 1
    }

    fn meta(mut self, meta: MetricDescriptor) -> Result<Self> {
        match meta {
            MetricDescriptor::Help {
                metric_name,
                help_text,
            } => {
                let index = self.family(&metric_name);
                self.families[index].help = Some(help_text);
            }
            MetricDescriptor::Type {
                metric_name,
                metric_type,
            } => {
                let index = self.family(&metric_name);
                self.families[index].declare(metric_type)?;
            }
        }

        Ok(self)
    }

    fn sample(mut self, sample: lexer::Sample, position: Position) -> Result<Self> {
        let (index, kind) = self.route(&sample.name);
        self.families[index].push(sample, kind, position)?;

        Ok(self)
    }

    /// An exact name match wins once that family has a type.  Failing that, a suffixed name
    /// belongs to the family named by the rest of it when that family's type uses the suffix.
    /// A family only known from its HELP line is the last resort.
    fn route(&mut self, sample_name: &str) -> (usize, SampleKind) {
        let exact = self.index.get(sample_name).copied();
        if let Some(index) = exact {
            if self.families[index].metric_type.is_some() {
                return (index, SampleKind::Other);
            }
        }

        for &(suffix, kind) in SUFFIXES {
            let family = sample_name
                .strip_suffix(suffix)
                .and_then(|base| self.index.get(base))
                .copied();

            if let Some(index) = family {
                let applies = self.families[index]
                    .metric_type
                    .map_or(false, |metric_type| kind.applies_to(metric_type));
                if applies {
                    trace!(sample_name, ?kind, family = %self.families[index].name);
                    return (index, kind);
                }
            }
        }

        (self.family(sample_name), SampleKind::Other)
    }

    fn finalize(self) -> std::result::Result<MetricFamilies, ParseError> {
        let families = self
            .families
            .into_iter()
            .map(FamilyBuilder::finalize)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(MetricFamilies {
            families,
            index: self.index,
        })
    }
}

impl FamilyBuilder {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            help: None,
            metric_type: None,
            metrics: vec![],
            series: vec![],
            series_index: HashMap::default(),
        }
    }

    /// Repeating the type that's already in effect is harmless, anything else is a conflict.
    fn declare(&mut self, metric_type: MetricType) -> Result<()> {
        match self.metric_type {
            None => {
                self.metric_type = Some(metric_type);
                Ok(())
            }
            Some(declared) if declared == metric_type => Ok(()),
            Some(declared) => Err(ErrorKind::DuplicateTypeDeclaration {
                family: self.name.clone(),
                declared,
                requested: metric_type,
            }),
        }
    }

    fn push(&mut self, sample: lexer::Sample, kind: SampleKind, position: Position) -> Result<()> {
        let metric_type = *self.metric_type.get_or_insert(MetricType::Untyped);

        let value = match metric_type {
            MetricType::Counter => MetricValue::Counter(sample.number),
            MetricType::Gauge => MetricValue::Gauge(sample.number),
            MetricType::Info => MetricValue::Info(sample.number),
            MetricType::Untyped => MetricValue::Untyped(sample.number),
            MetricType::Histogram | MetricType::Summary => {
                return self.push_point(metric_type, sample, kind, position)
            }
        };

        self.metrics.push(Metric {
            labels: sample.labels.into(),
            value,
            timestamp_ms: sample.timestamp,
        });

        Ok(())
    }

    fn push_point(
        &mut self,
        metric_type: MetricType,
        sample: lexer::Sample,
        kind: SampleKind,
        position: Position,
    ) -> Result<()> {
        let lexer::Sample {
            name,
            labels,
            number,
            timestamp,
        } = sample;
        let mut labels = LabelSet::from(labels);

        let point = match (metric_type, kind) {
            (MetricType::Histogram, SampleKind::Bucket) => {
                let upper_bound = labels
                    .remove("le")
                    .and_then(|le| parse_number(&le))
                    .filter(|le| !le.is_nan())
                    .ok_or_else(|| ErrorKind::BadBucket(name.clone()))?;
                let cumulative_count = count(&name, number)?;
                trace!(upper_bound, cumulative_count, "bucket");

                Some((upper_bound, cumulative_count as f64))
            }
            (MetricType::Summary, SampleKind::Other) => {
                let quantile = labels
                    .remove("quantile")
                    .and_then(|quantile| parse_number(&quantile))
                    .filter(|quantile| (0.0..=1.0).contains(quantile))
                    .ok_or_else(|| ErrorKind::BadQuantile(name.clone()))?;
                trace!(quantile, value = number, "quantile");

                Some((quantile, number))
            }
            (_, SampleKind::Other) => Err(ErrorKind::BadSuffix {
                sample: name.clone(),
                family: self.name.clone(),
            })?,
            _ => None,
        };

        let series = self.series(labels);
        series.last_seen = position;
        if timestamp.is_some() {
            series.timestamp = timestamp;
        }

        match (kind, point) {
            (_, Some((key, value))) => series.insert_point(key, value),
            (SampleKind::Sum, None) => series.sum = number,
            (SampleKind::Count, None) => series.count = Some(count(&name, number)?),
            (_, None) => {}
        }

        Ok(())
    }

    fn series(&mut self, labels: LabelSet) -> &mut SeriesBuilder {
        let key = labels.series_key();
        let series = &mut self.series;

        let index = *self.series_index.entry(key).or_insert_with(|| {
            series.push(SeriesBuilder::new(labels));
            series.len() - 1
        });

        &mut self.series[index]
    }

    fn finalize(self) -> std::result::Result<MetricFamily, ParseError> {
        let metric_type = self.metric_type.unwrap_or(MetricType::Untyped);
        let mut metrics = self.metrics;

        for series in self.series {
            let position = series.last_seen;
            let metric = match metric_type {
                MetricType::Histogram => series.into_histogram(&self.name),
                _ => Ok(series.into_summary()),
            }
            .map_err(|kind| ParseError::new(kind, position))?;

            metrics.push(metric);
        }

        Ok(MetricFamily {
            name: self.name,
            help: self.help,
            metric_type,
            metrics,
        })
    }
}

impl SeriesBuilder {
    fn new(labels: LabelSet) -> Self {
        Self {
            labels,
            timestamp: None,
            sum: 0.,
            count: None,
            points: vec![],
            last_seen: Position::default(),
        }
    }

    /// A repeated bound or quantile replaces the earlier value.
    fn insert_point(&mut self, key: f64, value: f64) {
        match self
            .points
            .binary_search_by(|(existing, _)| existing.total_cmp(&key))
        {
            Ok(index) => self.points[index].1 = value,
            Err(index) => self.points.insert(index, (key, value)),
        }
    }

    fn into_histogram(self, family: &str) -> Result<Metric> {
        let buckets = self
            .points
            .into_iter()
            .map(|(upper_bound, cumulative_count)| Bucket {
                upper_bound,
                cumulative_count: cumulative_count as u64,
            })
            .collect::<Vec<_>>();

        let inf_bucket = match buckets.last() {
            Some(bucket) if bucket.upper_bound == f64::INFINITY => bucket.cumulative_count,
            _ => Err(ErrorKind::MissingInfBucket(family.to_string()))?,
        };

        #[cfg(feature = "validate_histogram_count")]
        if let Some(count) = self.count {
            if count != inf_bucket {
                Err(ErrorKind::HistogramCountMismatch {
                    family: family.to_string(),
                    count,
                    inf_bucket,
                })?
            }
        }

        Ok(Metric {
            labels: self.labels,
            value: MetricValue::Histogram(Histogram {
                // Without a _count sample the +Inf bucket has the same information
                count: self.count.unwrap_or(inf_bucket),
                sum: self.sum,
                buckets,
            }),
            timestamp_ms: self.timestamp,
        })
    }

    fn into_summary(self) -> Metric {
        Metric {
            labels: self.labels,
            value: MetricValue::Summary(Summary {
                count: self.count.unwrap_or(0),
                sum: self.sum,
                quantiles: self
                    .points
                    .into_iter()
                    .map(|(quantile, value)| Quantile { quantile, value })
                    .collect(),
            }),
            timestamp_ms: self.timestamp,
        }
    }
}

/// Counts are written as floats but have to be whole, non-negative numbers.
fn count(sample: &str, number: f64) -> Result<u64> {
    // u64::MAX as f64 rounds up to 2^64, the first value that no longer fits
    if !number.is_finite() || number < 0. || number.round() >= u64::MAX as f64 {
        Err(ErrorKind::InvalidCount {
            sample: sample.to_string(),
            value: number,
        })?
    }

    Ok(number.round() as u64)
}

/// Folds a token stream into [`MetricFamilies`], stopping at the first error.
#[tracing::instrument(skip_all)]
pub fn parse<I>(tokens: I) -> std::result::Result<MetricFamilies, ParseError>
where
    I: IntoIterator<Item = std::result::Result<(Position, MetricToken), ParseError>>,
{
    tokens
        .into_iter()
        .try_fold(Builder::new(), |builder, token| {
            let (position, token) = token?;
            let builder = match token {
                MetricToken::Descriptor(meta) => builder.meta(meta),
                MetricToken::Metric(sample) => builder.sample(sample, position),
                MetricToken::Comment | MetricToken::Empty => Ok(builder),
            };

            builder.map_err(|kind| ParseError::new(kind, position))
        })?
        .finalize()
}

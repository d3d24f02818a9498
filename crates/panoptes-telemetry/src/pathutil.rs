//! Telemetry path parsing and sensor matching.
//!
//! Paths are slash-delimited with optional `[key=value]` selectors per
//! segment (`/interfaces/interface[name=Ethernet1]/state/counters`).
//! Matching a decoded path against the configured sensors uses the
//! longest prefix of segment names, with selectors stripped on both
//! sides; the selector values are preserved into the labels.

use std::collections::BTreeMap;

use panoptes_config::Sensor;

/// One path element with its selector key-value pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegment {
    /// Element name without selectors.
    pub name: String,
    /// Selector pairs in their path order.
    pub keys: Vec<(String, String)>,
}

impl PathSegment {
    /// A segment without selectors.
    #[must_use]
    pub fn bare(name: &str) -> Self {
        Self {
            name: name.to_string(),
            keys: Vec::new(),
        }
    }
}

/// Parses a slash-delimited path into segments.
///
/// Selector values may be bare (`[name=Ethernet1]`) or single-quoted
/// the way JTI renders them (`[name='ge-0/0/0']`); quotes are dropped.
#[must_use]
pub fn parse_path(path: &str) -> Vec<PathSegment> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;

    // Selector values may contain slashes (ge-0/0/0), so the split
    // tracks bracket depth instead of using str::split.
    for ch in path.chars() {
        match ch {
            '[' => {
                depth += 1;
                current.push(ch);
            }
            ']' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            '/' if depth == 0 => {
                if !current.is_empty() {
                    segments.push(parse_segment(&current));
                    current.clear();
                }
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        segments.push(parse_segment(&current));
    }
    segments
}

/// Parses a single path element that may carry inline selectors
/// (`interface[name=Ethernet1]`), as some targets render structured
/// element names.
#[must_use]
pub fn parse_element(element: &str) -> PathSegment {
    parse_segment(element)
}

fn parse_segment(segment: &str) -> PathSegment {
    let Some(bracket) = segment.find('[') else {
        return PathSegment::bare(segment);
    };

    let name = segment[..bracket].to_string();
    let mut keys = Vec::new();
    for part in segment[bracket..].split('[') {
        let part = part.trim_end_matches(']');
        if part.is_empty() {
            continue;
        }
        if let Some((key, value)) = part.split_once('=') {
            let value = value.trim_matches('\'').trim_matches('"');
            keys.push((key.to_string(), value.to_string()));
        }
    }
    PathSegment { name, keys }
}

/// Collects every selector pair of a segment list into labels.
#[must_use]
pub fn collect_labels(segments: &[PathSegment]) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    for segment in segments {
        for (key, value) in &segment.keys {
            labels.insert(key.clone(), value.clone());
        }
    }
    labels
}

/// A configured sensor prepared for path matching.
#[derive(Debug, Clone)]
pub struct SensorSpec {
    /// Sensor name within the config namespace.
    pub name: String,
    /// The configured path, verbatim (becomes the data point prefix).
    pub path: String,
    /// Output route.
    pub output: String,
    /// Collector-side duplicate filtering.
    pub suppress_redundant: bool,
    /// Segment names with selectors stripped, for matching.
    segments: Vec<String>,
}

impl SensorSpec {
    /// Prepares a sensor for matching.
    #[must_use]
    pub fn new(name: &str, sensor: &Sensor) -> Self {
        Self {
            name: name.to_string(),
            path: sensor.path.clone(),
            output: sensor.output.clone(),
            suppress_redundant: sensor.suppress_redundant,
            segments: parse_path(&sensor.path)
                .into_iter()
                .map(|segment| segment.name)
                .collect(),
        }
    }
}

/// Longest-prefix matcher over a device's configured sensors.
#[derive(Debug)]
pub struct SensorMatcher {
    specs: Vec<SensorSpec>,
}

impl SensorMatcher {
    /// Builds the matcher; longer paths are tried first.
    #[must_use]
    pub fn new(mut specs: Vec<SensorSpec>) -> Self {
        specs.sort_by(|a, b| b.segments.len().cmp(&a.segments.len()));
        Self { specs }
    }

    /// The most specific sensor whose stripped path is a prefix of
    /// `names`, with the number of matched segments.
    #[must_use]
    pub fn longest_match(&self, names: &[&str]) -> Option<(&SensorSpec, usize)> {
        self.specs
            .iter()
            .find(|spec| {
                spec.segments.len() <= names.len()
                    && spec.segments.iter().zip(names).all(|(a, b)| a == b)
            })
            .map(|spec| (spec, spec.segments.len()))
    }
}

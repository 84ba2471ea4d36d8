//! Measurement session data model and its JSON file format.
//!
//! ```json
//! {
//!   "margin": 300,
//!   "iterationNumber": 2,
//!   "data": [
//!     {
//!       "config": "stress-ng -c 1 -t 10",
//!       "measuredData": [
//!         {
//!           "power": [{ "time": 1700000000000, "power": 5230 }],
//!           "annotation": { "start": 1700000000050, "end": 1700000010050 }
//!         }
//!       ]
//!     }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{PowerTestError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerSample {
    #[serde(rename = "time")]
    pub timestamp_millis: i64,
    #[serde(rename = "power")]
    pub power_milliwatts: i64,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AnnotationLabel {
    Start,
    End,
}

impl AnnotationLabel {
    /// Every label found in one chunk of DUT output, in order of appearance.
    /// A short workload can put `start` and `end` into the same read.
    pub fn detect_all(chunk: &str) -> Vec<Self> {
        let mut found: Vec<(usize, Self)> = chunk
            .match_indices("start")
            .map(|(at, _)| (at, Self::Start))
            .chain(chunk.match_indices("end").map(|(at, _)| (at, Self::End)))
            .collect();
        found.sort_by_key(|(at, _)| *at);
        found.into_iter().map(|(_, label)| label).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnotationMarker {
    pub timestamp_millis: i64,
    pub label: AnnotationLabel,
}

/// Samples and markers of one iteration of one configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationRecord {
    #[serde(rename = "power")]
    pub samples: Vec<PowerSample>,
    #[serde(rename = "annotation", with = "annotation_map")]
    pub annotations: Vec<AnnotationMarker>,
}

impl IterationRecord {
    pub fn first_marker(&self, label: AnnotationLabel) -> Option<i64> {
        self.annotations
            .iter()
            .find(|m| m.label == label)
            .map(|m| m.timestamp_millis)
    }

    pub fn has_marker(&self, label: AnnotationLabel) -> bool {
        self.first_marker(label).is_some()
    }

    /// The first `start` marker and the first `end` marker after it.
    pub fn workload_window(&self) -> Option<(i64, i64)> {
        let start_pos = self
            .annotations
            .iter()
            .position(|m| m.label == AnnotationLabel::Start)?;
        let start = self.annotations[start_pos].timestamp_millis;
        let end = self.annotations[start_pos..]
            .iter()
            .find(|m| m.label == AnnotationLabel::End)?
            .timestamp_millis;
        Some((start, end))
    }

    /// Samples strictly inside `(start + margin, end - margin)`. Empty when
    /// the record has no start/end pair.
    pub fn trimmed_samples(&self, margin_millis: i64) -> Vec<PowerSample> {
        let Some((start, end)) = self.workload_window() else {
            return Vec::new();
        };
        let lower = start.saturating_add(margin_millis);
        let upper = end.saturating_sub(margin_millis);
        self.samples
            .iter()
            .filter(|s| s.timestamp_millis > lower && s.timestamp_millis < upper)
            .copied()
            .collect()
    }
}

/// One configuration slot: the workload script and its finished iterations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(rename = "config")]
    pub script_text: String,
    #[serde(rename = "measuredData", default)]
    pub iteration_records: Vec<IterationRecord>,
}

impl RunnerConfig {
    pub fn new(script_text: impl Into<String>) -> Self {
        Self {
            script_text: script_text.into(),
            iteration_records: Vec::new(),
        }
    }

    /// Trimmed power values of every iteration, concatenated in order.
    pub fn aggregate_power(&self, margin_millis: i64) -> Vec<i64> {
        self.iteration_records
            .iter()
            .flat_map(|record| record.trimmed_samples(margin_millis))
            .map(|s| s.power_milliwatts)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "margin")]
    pub margin_time_millis: i64,
    #[serde(rename = "iterationNumber")]
    pub iteration_count: u32,
    #[serde(rename = "data")]
    pub runner_configs: Vec<RunnerConfig>,
}

pub const DEFAULT_MARGIN_MILLIS: i64 = 300;
pub const DEFAULT_ITERATION_COUNT: u32 = 2;

impl Default for Session {
    fn default() -> Self {
        Self {
            margin_time_millis: DEFAULT_MARGIN_MILLIS,
            iteration_count: DEFAULT_ITERATION_COUNT,
            runner_configs: Vec::new(),
        }
    }
}

impl Session {
    pub fn new(margin_time_millis: i64, iteration_count: u32) -> Self {
        Self {
            margin_time_millis,
            iteration_count,
            runner_configs: Vec::new(),
        }
    }

    /// Every configuration holds exactly `iteration_count` records.
    pub fn is_complete(&self) -> bool {
        !self.runner_configs.is_empty()
            && self
                .runner_configs
                .iter()
                .all(|c| c.iteration_records.len() == self.iteration_count as usize)
    }

    pub fn clear_records(&mut self) {
        for config in &mut self.runner_configs {
            config.iteration_records.clear();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.margin_time_millis < 0 {
            return Err(PowerTestError::SessionFormat(format!(
                "negative margin {}",
                self.margin_time_millis
            )));
        }
        for (i, config) in self.runner_configs.iter().enumerate() {
            if config.iteration_records.len() > self.iteration_count as usize {
                return Err(PowerTestError::SessionFormat(format!(
                    "config {} holds {} iterations but the session declares {}",
                    i + 1,
                    config.iteration_records.len(),
                    self.iteration_count
                )));
            }
        }
        Ok(())
    }

    /// Trimmed power values per configuration, in declaration order.
    pub fn aggregate_power(&self) -> Vec<Vec<i64>> {
        self.runner_configs
            .iter()
            .map(|c| c.aggregate_power(self.margin_time_millis))
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json_str: &str) -> Result<Self> {
        let session: Session = serde_json::from_str(json_str)?;
        session.validate()?;
        Ok(session)
    }
}

/// `annotation` is written as a label → time mapping. Entries keep marker
/// order on the way out and document order on the way back in.
mod annotation_map {
    use serde::{
        de::{self, MapAccess, Visitor},
        ser::SerializeMap,
        Deserializer, Serializer,
    };
    use std::fmt;

    use super::{AnnotationLabel, AnnotationMarker, FromStr};

    pub fn serialize<S: Serializer>(
        markers: &[AnnotationMarker],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(markers.len()))?;
        for marker in markers {
            map.serialize_entry(marker.label.as_ref(), &marker.timestamp_millis)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<AnnotationMarker>, D::Error> {
        struct MarkerVisitor;

        impl<'de> Visitor<'de> for MarkerVisitor {
            type Value = Vec<AnnotationMarker>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of annotation label to time")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut markers = Vec::new();
                while let Some((label, time)) = access.next_entry::<String, i64>()? {
                    let label = AnnotationLabel::from_str(&label)
                        .map_err(|_| de::Error::unknown_variant(&label, &["start", "end"]))?;
                    markers.push(AnnotationMarker {
                        timestamp_millis: time,
                        label,
                    });
                }
                Ok(markers)
            }
        }

        deserializer.deserialize_map(MarkerVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(timestamp_millis: i64, label: AnnotationLabel) -> AnnotationMarker {
        AnnotationMarker {
            timestamp_millis,
            label,
        }
    }

    fn record(seed: i64) -> IterationRecord {
        IterationRecord {
            samples: (0..5)
                .map(|i| PowerSample {
                    timestamp_millis: seed * 1000 + i * 100,
                    power_milliwatts: seed * 10 + i,
                })
                .collect(),
            annotations: vec![
                marker(seed * 1000 + 50, AnnotationLabel::Start),
                marker(seed * 1000 + 450, AnnotationLabel::End),
            ],
        }
    }

    #[test]
    fn margin_trimming_keeps_strict_interior() {
        let rec = IterationRecord {
            samples: (0..10)
                .map(|i| PowerSample {
                    timestamp_millis: i * 100,
                    power_milliwatts: 1000 + i * 100,
                })
                .collect(),
            annotations: vec![
                marker(50, AnnotationLabel::Start),
                marker(850, AnnotationLabel::End),
            ],
        };
        let times: Vec<i64> = rec
            .trimmed_samples(100)
            .iter()
            .map(|s| s.timestamp_millis)
            .collect();
        assert_eq!(times, vec![200, 300, 400, 500, 600, 700]);
        assert_eq!(rec.samples.len(), 10);
    }

    #[test]
    fn trimming_without_marker_pair_is_empty() {
        let mut rec = record(1);
        rec.annotations.retain(|m| m.label == AnnotationLabel::Start);
        assert!(rec.trimmed_samples(0).is_empty());

        let mut rec = record(1);
        rec.annotations.reverse();
        assert!(rec.trimmed_samples(0).is_empty());
    }

    #[test]
    fn detect_classifies_chunks() {
        use AnnotationLabel::{End, Start};
        assert_eq!(AnnotationLabel::detect_all("start\r\n"), vec![Start]);
        assert_eq!(AnnotationLabel::detect_all("root# end\n"), vec![End]);
        assert!(AnnotationLabel::detect_all("stop\n").is_empty());
        assert_eq!(AnnotationLabel::detect_all("start\r\nend\r\n"), vec![Start, End]);
        assert_eq!(
            AnnotationLabel::detect_all("end\nstop\nstart\n"),
            vec![End, Start]
        );
    }

    #[test]
    fn trimming_extreme_timestamps_saturates() {
        let sample = |timestamp_millis, power_milliwatts| PowerSample {
            timestamp_millis,
            power_milliwatts,
        };
        let wide = IterationRecord {
            samples: vec![sample(i64::MIN + 1, 1), sample(0, 2)],
            annotations: vec![
                marker(i64::MIN, AnnotationLabel::Start),
                marker(i64::MAX, AnnotationLabel::End),
            ],
        };
        let powers = |samples: Vec<PowerSample>| -> Vec<i64> {
            samples.iter().map(|s| s.power_milliwatts).collect()
        };
        assert_eq!(powers(wide.trimmed_samples(100)), vec![2]);
        assert_eq!(powers(wide.trimmed_samples(-5)), vec![1, 2]);

        let late = IterationRecord {
            samples: vec![sample(i64::MAX - 2, 3)],
            annotations: vec![
                marker(i64::MAX - 5, AnnotationLabel::Start),
                marker(i64::MAX, AnnotationLabel::End),
            ],
        };
        assert!(late.trimmed_samples(100).is_empty());
    }

    #[test]
    fn round_trip_two_configs_three_iterations() {
        let mut session = Session::new(250, 3);
        for c in 0..2 {
            let mut config = RunnerConfig::new(format!("stress-ng -c {} -t 10", c + 1));
            for i in 0..3 {
                config.iteration_records.push(record(c * 10 + i));
            }
            session.runner_configs.push(config);
        }

        let text = session.to_json().unwrap();
        let loaded = Session::from_json(&text).unwrap();
        assert_eq!(loaded, session);
        assert!(loaded.is_complete());
    }

    #[test]
    fn file_format_field_names() {
        let mut session = Session::new(300, 1);
        let mut config = RunnerConfig::new("sleep 1");
        config.iteration_records.push(IterationRecord {
            samples: vec![PowerSample {
                timestamp_millis: 10,
                power_milliwatts: 20,
            }],
            annotations: vec![marker(5, AnnotationLabel::Start), marker(30, AnnotationLabel::End)],
        });
        session.runner_configs.push(config);

        let value: serde_json::Value = serde_json::from_str(&session.to_json().unwrap()).unwrap();
        assert_eq!(value["margin"], 300);
        assert_eq!(value["iterationNumber"], 1);
        assert_eq!(value["data"][0]["config"], "sleep 1");
        let measured = &value["data"][0]["measuredData"][0];
        assert_eq!(measured["power"][0]["time"], 10);
        assert_eq!(measured["power"][0]["power"], 20);
        assert_eq!(measured["annotation"]["start"], 5);
        assert_eq!(measured["annotation"]["end"], 30);
    }

    #[test]
    fn annotation_mapping_keeps_document_order() {
        let text = r#"{"power": [], "annotation": {"end": 9, "start": 3}}"#;
        let rec: IterationRecord = serde_json::from_str(text).unwrap();
        assert_eq!(
            rec.annotations,
            vec![marker(9, AnnotationLabel::End), marker(3, AnnotationLabel::Start)]
        );
    }

    #[test]
    fn import_rejects_more_records_than_iterations() {
        let mut session = Session::new(0, 1);
        let mut config = RunnerConfig::new("true");
        config.iteration_records = vec![record(1), record(2)];
        session.runner_configs.push(config);
        let text = serde_json::to_string(&session).unwrap();
        assert!(matches!(
            Session::from_json(&text),
            Err(PowerTestError::SessionFormat(_))
        ));
    }

    #[test]
    fn unknown_annotation_label_is_rejected() {
        let text = r#"{"power": [], "annotation": {"middle": 1}}"#;
        assert!(serde_json::from_str::<IterationRecord>(text).is_err());
    }
}

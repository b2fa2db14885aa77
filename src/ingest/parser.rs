// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Telemetry parsing.
//!
//! Accepts the shapes hobby firmware usually prints:
//! - key/value pairs: `temp=21.5,hum=40.2` or `t:21.5; h:40`
//! - bare numbers: `21.5,40.2,1013.2` (temperature, humidity, pressure)
//! - JSON objects: `{"temperature": 21.5, "rssi": -60}`

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

use super::reassembler::Record;

/// A sensor the parser knows by name, with its documented range.
struct SensorField {
    name: &'static str,
    aliases: &'static [&'static str],
    min: f64,
    max: f64,
}

static KNOWN_FIELDS: [SensorField; 3] = [
    SensorField {
        name: "temperature",
        aliases: &["temperature", "temp", "t"],
        min: -40.0,
        max: 125.0,
    },
    SensorField {
        name: "humidity",
        aliases: &["humidity", "hum", "h", "rh"],
        min: 0.0,
        max: 100.0,
    },
    SensorField {
        name: "pressure",
        aliases: &["pressure", "pres", "press", "p"],
        min: 300.0,
        max: 1100.0,
    },
];

/// Why a single field was rejected.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldErrorKind {
    NotNumeric,
    OutOfRange { min: f64, max: f64 },
}

/// A field that could not be turned into a value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    /// Field name as the device sent it.
    pub field: String,
    pub raw: String,
    pub reason: FieldErrorKind,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            FieldErrorKind::NotNumeric => write!(f, "{}='{}' is not numeric", self.field, self.raw),
            FieldErrorKind::OutOfRange { min, max } => write!(
                f,
                "{}={} outside sensor range [{}, {}]",
                self.field, self.raw, min, max
            ),
        }
    }
}

/// A timestamped set of numeric readings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    pub fields: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FieldError>,
}

impl TelemetrySample {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied()
    }

    pub fn temperature(&self) -> Option<f64> {
        self.get("temperature")
    }

    pub fn humidity(&self) -> Option<f64> {
        self.get("humidity")
    }

    pub fn pressure(&self) -> Option<f64> {
        self.get("pressure")
    }
}

/// Result of parsing one record.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Sample(TelemetrySample),
    /// Nothing usable in the record. Field failures, if any, are kept.
    Unparsed {
        record: String,
        failures: Vec<FieldError>,
    },
}

/// Converts records into telemetry samples.
#[derive(Debug, Default, Clone)]
pub struct TelemetryParser;

impl TelemetryParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse a record, stamping the sample with the current time.
    pub fn parse(&self, record: &Record) -> ParseOutcome {
        match record.as_text() {
            Some(text) => self.parse_line(text, Utc::now()),
            None => ParseOutcome::Unparsed {
                record: record.display_text(),
                failures: Vec::new(),
            },
        }
    }

    /// Parse one line of text.
    pub fn parse_line(&self, line: &str, timestamp: DateTime<Utc>) -> ParseOutcome {
        let line = line.trim();
        let mut acc = FieldAccumulator::default();

        if line.starts_with('{') {
            match serde_json::from_str::<serde_json::Map<String, Value>>(line) {
                Ok(object) => {
                    for (key, value) in &object {
                        acc.add_json(key, value);
                    }
                }
                Err(e) => debug!("Line looks like JSON but is not an object: {}", e),
            }
        } else {
            let tokens: Vec<&str> = line
                .split([',', ';'])
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .collect();

            if tokens.iter().any(|t| t.contains(['=', ':'])) {
                for token in tokens {
                    if let Some((key, raw)) = token.split_once(['=', ':']) {
                        acc.add_text(key.trim(), raw.trim());
                    }
                }
            } else if !tokens.is_empty() && tokens.iter().all(|t| parse_number(t).is_some()) {
                acc.add_positional(&tokens);
            }
        }

        acc.finish(line, timestamp)
    }
}

#[derive(Default)]
struct FieldAccumulator {
    fields: BTreeMap<String, f64>,
    failures: Vec<FieldError>,
}

impl FieldAccumulator {
    fn add_text(&mut self, key: &str, raw: &str) {
        match known_field(key) {
            Some(field) => self.add_known(field, key, raw, parse_number(raw)),
            None => match parse_number(raw) {
                Some(value) => {
                    self.fields.insert(key.to_lowercase(), value);
                }
                None => debug!("Ignoring non-numeric field {}={}", key, raw),
            },
        }
    }

    fn add_json(&mut self, key: &str, value: &Value) {
        let number = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => parse_number(s),
            _ => None,
        };
        let raw = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        match known_field(key) {
            Some(field) => self.add_known(field, key, &raw, number),
            None => {
                if let Some(value) = number {
                    self.fields.insert(key.to_lowercase(), value);
                }
            }
        }
    }

    fn add_positional(&mut self, tokens: &[&str]) {
        if let [single] = tokens {
            if let Some(value) = parse_number(single) {
                self.fields.insert("value".to_string(), value);
            }
            return;
        }

        for (i, token) in tokens.iter().enumerate() {
            match KNOWN_FIELDS.get(i) {
                Some(field) => self.add_known(field, field.name, token, parse_number(token)),
                None => {
                    if let Some(value) = parse_number(token) {
                        self.fields.insert(format!("field{}", i + 1), value);
                    }
                }
            }
        }
    }

    fn add_known(&mut self, field: &SensorField, key: &str, raw: &str, value: Option<f64>) {
        let reason = match value {
            None => FieldErrorKind::NotNumeric,
            Some(v) if v < field.min || v > field.max => FieldErrorKind::OutOfRange {
                min: field.min,
                max: field.max,
            },
            Some(v) => {
                self.fields.insert(field.name.to_string(), v);
                return;
            }
        };

        self.failures.push(FieldError {
            field: key.to_string(),
            raw: raw.to_string(),
            reason,
        });
    }

    fn finish(self, line: &str, timestamp: DateTime<Utc>) -> ParseOutcome {
        if self.fields.is_empty() {
            return ParseOutcome::Unparsed {
                record: line.to_string(),
                failures: self.failures,
            };
        }

        ParseOutcome::Sample(TelemetrySample {
            timestamp,
            fields: self.fields,
            failures: self.failures,
        })
    }
}

fn known_field(key: &str) -> Option<&'static SensorField> {
    let key = key.to_lowercase();
    KNOWN_FIELDS
        .iter()
        .find(|f| f.aliases.contains(&key.as_str()))
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> ParseOutcome {
        TelemetryParser::new().parse_line(line, Utc::now())
    }

    fn sample(line: &str) -> TelemetrySample {
        match parse(line) {
            ParseOutcome::Sample(s) => s,
            other => panic!("expected sample for {:?}, got {:?}", line, other),
        }
    }

    #[test]
    fn test_key_value_aliases() {
        let s = sample("temp=21.5,hum=40.2,pres=1013.25");
        assert_eq!(s.temperature(), Some(21.5));
        assert_eq!(s.humidity(), Some(40.2));
        assert_eq!(s.pressure(), Some(1013.25));
        assert!(s.failures.is_empty());
    }

    #[test]
    fn test_colon_and_semicolon_separators() {
        let s = sample("T: 19.0; RH: 55");
        assert_eq!(s.temperature(), Some(19.0));
        assert_eq!(s.humidity(), Some(55.0));
    }

    #[test]
    fn test_bad_field_keeps_others() {
        let s = sample("temp=foo,hum=40");
        assert_eq!(s.humidity(), Some(40.0));
        assert_eq!(s.temperature(), None);
        assert_eq!(
            s.failures,
            vec![FieldError {
                field: "temp".to_string(),
                raw: "foo".to_string(),
                reason: FieldErrorKind::NotNumeric,
            }]
        );
    }

    #[test]
    fn test_out_of_range() {
        let s = sample("temperature=300,humidity=50");
        assert_eq!(s.temperature(), None);
        assert_eq!(s.failures.len(), 1);
        assert!(matches!(
            s.failures[0].reason,
            FieldErrorKind::OutOfRange { .. }
        ));
    }

    #[test]
    fn test_generic_fields() {
        let s = sample("rssi=-61,uptime=1200,status=ok");
        assert_eq!(s.get("rssi"), Some(-61.0));
        assert_eq!(s.get("uptime"), Some(1200.0));
        assert_eq!(s.fields.len(), 2);
        assert!(s.failures.is_empty());
    }

    #[test]
    fn test_positional_csv() {
        let s = sample("21.5, 40.2, 1013.2, 7");
        assert_eq!(s.temperature(), Some(21.5));
        assert_eq!(s.humidity(), Some(40.2));
        assert_eq!(s.pressure(), Some(1013.2));
        assert_eq!(s.get("field4"), Some(7.0));

        let single = sample("42");
        assert_eq!(single.get("value"), Some(42.0));
    }

    #[test]
    fn test_json_object() {
        let s = sample(r#"{"temperature": 22.25, "humidity": "48", "rssi": -70, "id": "esp32"}"#);
        assert_eq!(s.temperature(), Some(22.25));
        assert_eq!(s.humidity(), Some(48.0));
        assert_eq!(s.get("rssi"), Some(-70.0));
        assert_eq!(s.get("id"), None);
    }

    #[test]
    fn test_unrecognized_lines() {
        for line in ["Booting ESP32...", "", "WiFi connected, ip 192.168.1.4", "{not json"] {
            assert!(
                matches!(parse(line), ParseOutcome::Unparsed { .. }),
                "line {:?}",
                line
            );
        }
    }

    #[test]
    fn test_only_bad_fields_is_unparsed() {
        match parse("temp=nan") {
            ParseOutcome::Unparsed { failures, .. } => assert_eq!(failures.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_binary_record_is_unparsed() {
        let outcome = TelemetryParser::new().parse(&Record::new(vec![0xff, 0xfe]));
        assert_eq!(
            outcome,
            ParseOutcome::Unparsed {
                record: "fffe".to_string(),
                failures: Vec::new(),
            }
        );
    }
}

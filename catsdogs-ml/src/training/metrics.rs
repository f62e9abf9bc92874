//! Per-epoch metric history of a training run.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

pub const BINARY_ACCURACY: &str = "binary_accuracy";
pub const VAL_BINARY_ACCURACY: &str = "val_binary_accuracy";
pub const LOSS: &str = "loss";
pub const VAL_LOSS: &str = "val_loss";

/// Metric names recorded every epoch.
pub const METRIC_NAMES: [&str; 4] = [BINARY_ACCURACY, VAL_BINARY_ACCURACY, LOSS, VAL_LOSS];

/// Metrics of one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub loss: f64,
    pub binary_accuracy: f64,
    pub val_loss: f64,
    pub val_binary_accuracy: f64,
}

/// Training result: metric name -> ordered per-epoch values.
///
/// A diverged run records NaN or infinite values. JSON has no literal for
/// those, so they are stored as the strings `"NaN"`, `"inf"` and `"-inf"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    #[serde(with = "non_finite")]
    pub history: BTreeMap<String, Vec<f64>>,
}

mod non_finite {
    use super::*;
    use serde::de::Error as _;

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Value {
        Number(f64),
        Tagged(String),
    }

    impl From<f64> for Value {
        fn from(v: f64) -> Self {
            if v.is_nan() {
                Value::Tagged("NaN".into())
            } else if v == f64::INFINITY {
                Value::Tagged("inf".into())
            } else if v == f64::NEG_INFINITY {
                Value::Tagged("-inf".into())
            } else {
                Value::Number(v)
            }
        }
    }

    impl Value {
        fn into_f64(self) -> Result<f64, String> {
            match self {
                Value::Number(v) => Ok(v),
                Value::Tagged(tag) => match tag.as_str() {
                    "NaN" => Ok(f64::NAN),
                    "inf" => Ok(f64::INFINITY),
                    "-inf" => Ok(f64::NEG_INFINITY),
                    other => Err(format!("invalid metric value: {other:?}")),
                },
            }
        }
    }

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<String, Vec<f64>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let encoded: BTreeMap<&str, Vec<Value>> = map
            .iter()
            .map(|(name, values)| {
                (
                    name.as_str(),
                    values.iter().copied().map(Value::from).collect(),
                )
            })
            .collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<f64>>, D::Error> {
        let raw = BTreeMap::<String, Vec<Value>>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(name, values)| {
                let values = values
                    .into_iter()
                    .map(Value::into_f64)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(D::Error::custom)?;
                Ok((name, values))
            })
            .collect()
    }
}

impl Default for History {
    fn default() -> Self {
        Self {
            history: METRIC_NAMES
                .iter()
                .map(|name| (name.to_string(), Vec::new()))
                .collect(),
        }
    }
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_epoch(&mut self, epoch: EpochMetrics) {
        let values = [
            (BINARY_ACCURACY, epoch.binary_accuracy),
            (VAL_BINARY_ACCURACY, epoch.val_binary_accuracy),
            (LOSS, epoch.loss),
            (VAL_LOSS, epoch.val_loss),
        ];
        for (name, value) in values {
            self.history.entry(name.to_string()).or_default().push(value);
        }
    }

    /// Values of `name`, empty if the metric was never recorded.
    pub fn metric(&self, name: &str) -> &[f64] {
        self.history.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of completed epochs.
    pub fn epochs(&self) -> usize {
        self.metric(LOSS).len()
    }

    /// 1-based epoch with the highest validation accuracy, and that accuracy.
    pub fn best_val_accuracy(&self) -> Option<(usize, f64)> {
        self.metric(VAL_BINARY_ACCURACY)
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, v)| !v.is_nan())
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, v)| (i + 1, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch(loss: f64, val_acc: f64) -> EpochMetrics {
        EpochMetrics {
            loss,
            binary_accuracy: 0.5,
            val_loss: loss + 0.1,
            val_binary_accuracy: val_acc,
        }
    }

    #[test]
    fn test_new_history_has_all_metrics() {
        let history = History::new();
        for name in METRIC_NAMES {
            assert!(history.history.contains_key(name));
        }
        assert_eq!(history.epochs(), 0);
        assert!(history.best_val_accuracy().is_none());
    }

    #[test]
    fn test_record_epoch() {
        let mut history = History::new();
        history.record_epoch(epoch(0.7, 0.55));
        history.record_epoch(epoch(0.5, 0.75));
        history.record_epoch(epoch(0.4, 0.70));

        assert_eq!(history.epochs(), 3);
        assert_eq!(history.metric(LOSS), &[0.7, 0.5, 0.4]);
        assert_eq!(history.metric(VAL_BINARY_ACCURACY), &[0.55, 0.75, 0.70]);
        assert_eq!(history.best_val_accuracy(), Some((2, 0.75)));
        assert!(history.metric("precision").is_empty());
    }

    #[test]
    fn test_history_json_shape() {
        let mut history = History::new();
        history.record_epoch(epoch(0.6, 0.6));
        let json = serde_json::to_value(&history).unwrap();
        assert_eq!(json["history"]["loss"], serde_json::json!([0.6]));
        assert_eq!(json["history"]["val_binary_accuracy"], serde_json::json!([0.6]));
    }

    #[test]
    fn test_diverged_history_roundtrips() {
        let mut history = History::new();
        history.record_epoch(EpochMetrics {
            loss: f64::NAN,
            binary_accuracy: 0.5,
            val_loss: f64::INFINITY,
            val_binary_accuracy: 0.5,
        });
        history.record_epoch(epoch(f64::NEG_INFINITY, 0.25));

        let json = serde_json::to_string(&history).unwrap();
        assert!(json.contains("\"NaN\""));
        let parsed: History = serde_json::from_str(&json).unwrap();

        assert!(parsed.metric(LOSS)[0].is_nan());
        assert_eq!(parsed.metric(LOSS)[1], f64::NEG_INFINITY);
        assert_eq!(parsed.metric(VAL_LOSS)[0], f64::INFINITY);
        assert_eq!(parsed.metric(VAL_BINARY_ACCURACY), &[0.5, 0.25]);
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let json = r#"{"history":{"loss":["bogus"]}}"#;
        assert!(serde_json::from_str::<History>(json).is_err());
    }
}

//! Property-based tests for sweeps, cache keys and result serialization.

use proptest::prelude::*;

use catsdogs_ml::training::cache::fingerprint;
use catsdogs_ml::training::metrics::EpochMetrics;
use catsdogs_ml::training::{SingleRunKey, SweepKey};
use catsdogs_ml::{History, RunCache, RunConfig, SweepConfig, SweepGrid};

fn grid_strategy() -> impl Strategy<Value = SweepGrid> {
    (
        prop::collection::vec(8usize..128, 0..3),
        prop::collection::vec(1usize..33, 0..3),
        prop::collection::vec(0.0001f64..1.0, 0..3),
        prop::collection::vec(0.0f64..0.1, 0..3),
        prop::collection::vec(0.0f64..0.1, 0..3),
    )
        .prop_map(
            |(image_widths, batch_sizes, learning_rates, l1_penalties, l2_penalties)| SweepGrid {
                image_widths,
                batch_sizes,
                learning_rates,
                l1_penalties,
                l2_penalties,
            },
        )
}

fn run_strategy() -> impl Strategy<Value = RunConfig> {
    (
        8usize..256,
        1usize..64,
        0.0001f64..1.0,
        0.0f64..0.1,
        0.0f64..0.1,
        1usize..300,
        any::<bool>(),
        any::<u64>(),
    )
        .prop_map(
            |(image_width, batch_size, learning_rate, l1, l2, epochs, prefetch, seed)| RunConfig {
                image_width,
                batch_size,
                learning_rate,
                l1_penalty: l1,
                l2_penalty: l2,
                epochs,
                prefetch,
                seed,
                ..RunConfig::default()
            },
        )
}

// --- Sweep enumeration properties ---

proptest! {
    #[test]
    fn sweep_length_is_product_of_list_lengths(grid in grid_strategy()) {
        let expected = grid.image_widths.len()
            * grid.batch_sizes.len()
            * grid.learning_rates.len()
            * grid.l1_penalties.len()
            * grid.l2_penalties.len();
        let sweep = SweepConfig { grid, ..SweepConfig::default() };
        prop_assert_eq!(sweep.combinations().len(), expected);
    }

    #[test]
    fn sweep_order_is_batch_slowest_width_fastest(grid in grid_strategy()) {
        let sweep = SweepConfig { grid: grid.clone(), ..SweepConfig::default() };
        let runs = sweep.combinations();

        let mut expected = Vec::new();
        for &b in &grid.batch_sizes {
            for &lr in &grid.learning_rates {
                for &l1 in &grid.l1_penalties {
                    for &l2 in &grid.l2_penalties {
                        for &w in &grid.image_widths {
                            expected.push((b, lr, l1, l2, w));
                        }
                    }
                }
            }
        }
        let actual: Vec<_> = runs
            .iter()
            .map(|r| (r.batch_size, r.learning_rate, r.l1_penalty, r.l2_penalty, r.image_width))
            .collect();
        prop_assert_eq!(actual, expected);
    }
}

// --- Cache key properties ---

proptest! {
    #[test]
    fn single_run_key_is_deterministic(run in run_strategy()) {
        let a = fingerprint(&SingleRunKey::from(&run)).unwrap();
        let b = fingerprint(&SingleRunKey::from(&run.clone())).unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn different_batch_sizes_use_different_files(run in run_strategy(), other in 1usize..64) {
        prop_assume!(other != run.batch_size);
        let cache = RunCache::new("runs");
        let changed = RunConfig { batch_size: other, ..run.clone() };
        prop_assert_ne!(
            cache.path_for(&SingleRunKey::from(&run)).unwrap(),
            cache.path_for(&SingleRunKey::from(&changed)).unwrap()
        );
    }

    #[test]
    fn sweep_keys_see_every_list_element(grid in grid_strategy(), extra in 0.0001f64..1.0) {
        let sweep = SweepConfig { grid, ..SweepConfig::default() };
        let mut longer = sweep.clone();
        longer.grid.learning_rates.push(extra);
        prop_assert_ne!(
            fingerprint(&SweepKey::from(&sweep)).unwrap(),
            fingerprint(&SweepKey::from(&longer)).unwrap()
        );
    }
}

// --- History serialization ---

/// Any metric value a training run can produce, diverged ones included.
fn metric_value() -> impl Strategy<Value = f64> {
    prop_oneof![
        8 => prop::num::f64::NORMAL | prop::num::f64::ZERO | prop::num::f64::SUBNORMAL,
        1 => Just(f64::NAN),
        1 => Just(f64::INFINITY),
        1 => Just(f64::NEG_INFINITY),
    ]
}

/// Bit patterns compare NaN equal to itself; NaN payloads are not preserved.
fn bits(history: &History) -> Vec<(String, Vec<u64>)> {
    history
        .history
        .iter()
        .map(|(name, values)| {
            let bits = values
                .iter()
                .map(|v| if v.is_nan() { f64::NAN.to_bits() } else { v.to_bits() })
                .collect();
            (name.clone(), bits)
        })
        .collect()
}

proptest! {
    #[test]
    fn history_json_roundtrip_is_identity(
        epochs in prop::collection::vec(
            (metric_value(), metric_value(), metric_value(), metric_value()),
            0..50,
        )
    ) {
        let mut history = History::new();
        for (loss, acc, val_loss, val_acc) in epochs {
            history.record_epoch(EpochMetrics {
                loss,
                binary_accuracy: acc,
                val_loss,
                val_binary_accuracy: val_acc,
            });
        }
        let json = serde_json::to_string(&history).unwrap();
        let parsed: History = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(bits(&parsed), bits(&history));
    }
}

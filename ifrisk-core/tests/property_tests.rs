//! Property tests for pipeline invariants.
//!
//! 1. Label cleaning is idempotent and leaves no control characters
//! 2. Number parsing never yields a non-finite value and reads thousands groups
//! 3. Scores stay in [0, 100] and agree with their rating
//! 4. Metric resolution does not depend on fact order
//! 5. Page-size ladders are strictly descending

use ifrisk_core::data::IngestConfig;
use ifrisk_core::domain::{qualify_label, CanonicalMetricSet, Metric, Period, RawFact, Rating};
use ifrisk_core::scoring::score;
use ifrisk_core::semantic::{resolve, RuleSet};
use ifrisk_core::text::{clean, parse_number_text};
use proptest::prelude::*;

// ── Strategies (proptest) ────────────────────────────────────────────

fn arb_metric_value() -> impl Strategy<Value = Option<f64>> {
    prop_oneof![
        Just(None),
        (-1.0e9..1.0e9_f64).prop_map(Some),
        (-50.0..150.0_f64).prop_map(Some),
    ]
}

fn arb_label() -> impl Strategy<Value = String> {
    prop::sample::select(vec![
        "Ativo Total",
        "Total do Ativo",
        "Patrimônio Líquido",
        "Lucro Líquido",
        "Índice de Basileia",
        "Índice de Liquidez",
        "Inadimplência 90 dias",
        "Carteira de Crédito",
        "Outras Receitas",
    ])
    .prop_map(str::to_string)
}

fn arb_fact() -> impl Strategy<Value = RawFact> {
    (
        prop::sample::select(vec!["1", "4", "5", "9"]),
        arb_label(),
        -1.0e7..1.0e7_f64,
    )
        .prop_map(|(report, label, value)| RawFact {
            period: Period::new(2025, 6).unwrap(),
            entity_id: "100".into(),
            entity_name: String::new(),
            raw_label: qualify_label(report, &label),
            value,
        })
}

/// `1234567` → `1.234.567`
fn group_thousands(units: u64) -> String {
    let digits = units.to_string();
    let mut grouped = String::new();
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }
    grouped
}

// ── 1. Label Cleaning ────────────────────────────────────────────────

proptest! {
    #[test]
    fn clean_is_idempotent(text in "\\PC{0,40}|[ \\t\\r\\n=a-z]{0,40}") {
        let once = clean(Some(&text));
        prop_assert_eq!(clean(Some(&once)), once.clone());
        prop_assert!(!once.chars().any(char::is_control));
        prop_assert!(!once.contains("  "));
        prop_assert_eq!(once.trim(), once.as_str());
    }
}

// ── 2. Number Parsing ────────────────────────────────────────────────

proptest! {
    #[test]
    fn parsed_numbers_are_finite(text in "[-+0-9.,eE ]{0,24}|[a-zA-Z]{1,8}") {
        if let Some(v) = parse_number_text(&text) {
            prop_assert!(v.is_finite());
        }
    }

    /// `1.234.567,89` style text reads back as the number it spells.
    #[test]
    fn brazilian_grouping_parses(units in 0u64..10_000_000_000, cents in 0u32..100) {
        let text = format!("{},{cents:02}", group_thousands(units));
        let expected = units as f64 + f64::from(cents) / 100.0;
        let parsed = parse_number_text(&text);
        prop_assert!(parsed.is_some(), "failed to parse {}", text);
        prop_assert!((parsed.unwrap() - expected).abs() < 1e-6 * expected.max(1.0));
    }

    /// `1.234.567` (dots only) is an integer, not a decimal.
    #[test]
    fn dot_only_grouping_parses(units in 1_000u64..10_000_000_000, negative in any::<bool>()) {
        let sign = if negative { "-" } else { "" };
        let text = format!("{sign}{}", group_thousands(units));
        let expected = if negative { -(units as f64) } else { units as f64 };
        prop_assert_eq!(parse_number_text(&text), Some(expected));
    }
}

// ── 3. Score Bounds ──────────────────────────────────────────────────

proptest! {
    #[test]
    fn score_is_bounded_and_matches_rating(
        capital in arb_metric_value(),
        liquidity in arb_metric_value(),
        npl in arb_metric_value(),
        roa in arb_metric_value(),
        leverage in arb_metric_value(),
    ) {
        let mut set = CanonicalMetricSet::empty(Period::new(2025, 6).unwrap(), "100", "Banco");
        set.set(Metric::CapitalRatio, capital);
        set.set(Metric::LiquidityRatio, liquidity);
        set.set(Metric::NplRatio, npl);
        set.roa = roa;
        set.leverage = leverage;

        let a = score(&set);
        prop_assert!(a.score <= 100);
        prop_assert_eq!(a.rating, Rating::from_score(a.score));
        prop_assert_eq!(a.drivers.len(), 5);
        prop_assert_eq!(score(&set), a);
    }
}

// ── 4. Order Independence ────────────────────────────────────────────

proptest! {
    #[test]
    fn resolution_ignores_fact_order(
        facts in prop::collection::vec(arb_fact(), 0..12),
        rotate in 0usize..12,
    ) {
        let rules = RuleSet::builtin().unwrap();
        let forward: Vec<&RawFact> = facts.iter().collect();
        let mut shuffled: Vec<&RawFact> = facts.iter().rev().collect();
        if !shuffled.is_empty() {
            let n = rotate % shuffled.len();
            shuffled.rotate_left(n);
        }
        for rule in rules.rules() {
            prop_assert_eq!(
                resolve(rule, &forward).map(f64::to_bits),
                resolve(rule, &shuffled).map(f64::to_bits),
                "metric {}", rule.metric.as_str()
            );
        }
    }
}

// ── 5. Page-Size Ladder ──────────────────────────────────────────────

proptest! {
    #[test]
    fn ladder_is_strictly_descending(
        sizes in prop::collection::vec(0usize..6000, 0..6),
        stored in prop::option::of(0usize..6000),
    ) {
        let cfg = IngestConfig { page_sizes: sizes, ..IngestConfig::default() };
        let ladder = cfg.ladder_from(stored);
        prop_assert!(!ladder.is_empty());
        prop_assert!(ladder.windows(2).all(|w| w[0] > w[1]));
        prop_assert!(ladder.iter().all(|&s| s > 0));
        if let Some(s) = stored.filter(|&s| s > 0) {
            prop_assert_eq!(ladder[0], s);
        }
    }
}

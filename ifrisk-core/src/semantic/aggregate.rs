//! Per-entity canonical metric sets with derived ratios.

use super::classifier::resolve;
use super::rules::RuleSet;
use crate::domain::{CanonicalMetricSet, Period, RawFact};
use std::collections::BTreeMap;

/// Build one metric set per entity from a period's raw facts.
///
/// Facts from other periods are ignored. The first non-empty entity name in
/// fact order names the entity. Output is ordered by entity id.
pub fn aggregate(period: Period, facts: &[RawFact], rules: &RuleSet) -> Vec<CanonicalMetricSet> {
    let mut by_entity: BTreeMap<&str, (&str, Vec<&RawFact>)> = BTreeMap::new();
    for fact in facts.iter().filter(|f| f.period == period) {
        let entry = by_entity
            .entry(fact.entity_id.as_str())
            .or_insert(("", Vec::new()));
        if entry.0.is_empty() && !fact.entity_name.is_empty() {
            entry.0 = fact.entity_name.as_str();
        }
        entry.1.push(fact);
    }

    by_entity
        .into_iter()
        .map(|(entity_id, (name, entity_facts))| {
            let mut set = CanonicalMetricSet::empty(period, entity_id, name);
            for rule in rules.rules() {
                set.set(rule.metric, resolve(rule, &entity_facts));
            }
            derive_ratios(&mut set);
            set
        })
        .collect()
}

/// `roa` and `leverage` from the resolved metrics.
pub fn derive_ratios(set: &mut CanonicalMetricSet) {
    set.roa = ratio(set.net_income, set.total_assets).map(|r| r * 100.0).filter(|v| v.is_finite());
    set.leverage = ratio(set.total_assets, set.equity);
}

fn ratio(numerator: Option<f64>, denominator: Option<f64>) -> Option<f64> {
    let (n, d) = (numerator?, denominator?);
    if d == 0.0 {
        return None;
    }
    Some(n / d).filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(entity: &str, name: &str, label: &str, value: f64) -> RawFact {
        RawFact {
            period: Period::new(2025, 6).unwrap(),
            entity_id: entity.into(),
            entity_name: name.into(),
            raw_label: label.into(),
            value,
        }
    }

    #[test]
    fn derived_ratios_from_resolved_metrics() {
        let rules = RuleSet::builtin().unwrap();
        let facts = vec![
            fact("1", "", "1::Ativo Total", 1_000_000.0),
            fact("1", "Banco Um", "1::Lucro Líquido", 5_000.0),
            fact("1", "Outro Nome", "1::Patrimônio Líquido", 100_000.0),
        ];
        let sets = aggregate(Period::new(2025, 6).unwrap(), &facts, &rules);
        assert_eq!(sets.len(), 1);
        let set = &sets[0];
        assert_eq!(set.entity_name, "Banco Um");
        assert!((set.roa.unwrap() - 0.5).abs() < 1e-12);
        assert_eq!(set.leverage, Some(10.0));
        assert_eq!(set.capital_ratio, None);
    }

    #[test]
    fn zero_equity_leaves_leverage_absent() {
        let mut set = CanonicalMetricSet::empty(Period::new(2025, 6).unwrap(), "1", "");
        set.total_assets = Some(1_000.0);
        set.equity = Some(0.0);
        set.net_income = Some(10.0);
        derive_ratios(&mut set);
        assert_eq!(set.leverage, None);
        assert!((set.roa.unwrap() - 1.0).abs() < 1e-12);

        set.total_assets = None;
        derive_ratios(&mut set);
        assert_eq!(set.roa, None);
    }

    #[test]
    fn entities_are_grouped_and_other_periods_ignored() {
        let rules = RuleSet::builtin().unwrap();
        let mut stale = fact("3", "Velho", "1::Ativo Total", 1.0);
        stale.period = Period::new(2024, 12).unwrap();
        let facts = vec![
            fact("2", "B", "1::Ativo Total", 10.0),
            fact("1", "A", "1::Ativo Total", 20.0),
            stale,
        ];
        let sets = aggregate(Period::new(2025, 6).unwrap(), &facts, &rules);
        let ids: Vec<_> = sets.iter().map(|s| s.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(sets[0].total_assets, Some(20.0));
    }
}

//! Entity id → display name map built from the institution registry.

use super::fetcher::{FetchError, ResilientFetcher};
use super::paging::drain;
use super::upstream::{first_field, scalar_text, Endpoints, FIELD_ENTITY_TYPE, FIELD_PERIOD};
use crate::domain::Period;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Registry fields that may hold the entity id, in lookup order.
pub const ID_KEYS: &[&str] = &[
    "CodInst",
    "CodIF",
    "CodIf",
    "CodInstituicao",
    "CodigoInstituicao",
    "CodConglomerado",
    "CodCong",
];

/// Registry fields that may hold the display name, in lookup order.
pub const NAME_KEYS: &[&str] = &[
    "NomeInstituicao",
    "Nome",
    "NomeIF",
    "NomeIf",
    "NomeConglomerado",
    "NomeCong",
];

/// Read-only once built. Rebuilt every run, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityMap {
    names: BTreeMap<String, String>,
}

impl IdentityMap {
    /// Build from registry rows. A later row naming the same id replaces the
    /// earlier name; rows without a name change nothing.
    pub fn from_rows<'a>(rows: impl IntoIterator<Item = &'a Value>) -> Self {
        let mut names = BTreeMap::new();
        for row in rows {
            let (Some(id), Some(name)) = (first_field(row, ID_KEYS), first_field(row, NAME_KEYS))
            else {
                continue;
            };
            names.insert(id, name);
        }
        Self { names }
    }

    /// Display name for `entity_id`, or `""` when unknown.
    pub fn name_of(&self, entity_id: &str) -> &str {
        self.names.get(entity_id).map(String::as_str).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Scans the registry for one (period, entity type).
pub struct IdentityResolver<'a> {
    fetcher: &'a ResilientFetcher,
    endpoints: &'a Endpoints,
    page_size: usize,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(fetcher: &'a ResilientFetcher, endpoints: &'a Endpoints, page_size: usize) -> Self {
        Self {
            fetcher,
            endpoints,
            page_size: page_size.max(1),
        }
    }

    /// Never fails: a scan that cannot complete yields an empty map.
    pub fn resolve(&self, period: Period, entity_type: u32) -> IdentityMap {
        match self.scan(period, entity_type) {
            Ok(map) => {
                info!(%period, entity_type, entities = map.len(), "identity map built");
                map
            }
            Err(e) => {
                warn!(%period, entity_type, error = %e, "registry scan failed; entity names will be empty");
                IdentityMap::default()
            }
        }
    }

    fn scan(&self, period: Period, entity_type: u32) -> Result<IdentityMap, FetchError> {
        let filtered = self.endpoints.registry_filtered(period, entity_type);
        match drain(&filtered, self.fetcher, self.page_size) {
            Ok(rows) => Ok(IdentityMap::from_rows(&rows)),
            Err(e) if e.is_permanent() => {
                warn!(
                    %period,
                    entity_type,
                    error = %e,
                    "filtered registry query rejected; falling back to unfiltered scan"
                );
                let all = drain(&self.endpoints.registry_unfiltered(), self.fetcher, self.page_size)?;
                Ok(IdentityMap::from_rows(
                    all.iter().filter(|row| row_matches(row, period, entity_type)),
                ))
            }
            Err(e) => Err(e),
        }
    }
}

/// Client-side equivalent of the server filter. Rows lacking a field are kept.
fn row_matches(row: &Value, period: Period, entity_type: u32) -> bool {
    let field_is = |field: &str, expected: String| match scalar_text(row.get(field)) {
        Some(actual) => actual == expected,
        None => true,
    };
    field_is(FIELD_PERIOD, period.anomes().to_string())
        && field_is(FIELD_ENTITY_TYPE, entity_type.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::retry::RetryPolicy;
    use crate::data::transport::{HttpResponse, TimeoutTiers, Transport, TransportError};
    use serde_json::json;
    use std::sync::Arc;

    /// Rejects any `$filter` with HTTP 400 when `reject_filter` is set.
    struct Registry {
        reject_filter: bool,
        fail_everything: bool,
        rows: Vec<Value>,
    }

    impl Transport for Registry {
        fn get(
            &self,
            _url: &str,
            query: &[(String, String)],
            _timeouts: &TimeoutTiers,
        ) -> Result<HttpResponse, TransportError> {
            if self.fail_everything {
                return Ok(HttpResponse::status(503, "down"));
            }
            let filtered = query.iter().any(|(k, _)| k == "$filter");
            if filtered && self.reject_filter {
                return Ok(HttpResponse::status(400, "filter not supported"));
            }
            let skip = query
                .iter()
                .find(|(k, _)| k == "$skip")
                .and_then(|(_, v)| v.parse::<usize>().ok())
                .unwrap_or(0);
            let rows: Vec<_> = self.rows.iter().skip(skip).cloned().collect();
            Ok(HttpResponse::ok(json!({ "value": rows }).to_string()))
        }
    }

    fn resolve(t: Registry) -> IdentityMap {
        let fetcher = ResilientFetcher::new(
            Arc::new(t),
            RetryPolicy::immediate(2),
            TimeoutTiers::default(),
        );
        let endpoints = Endpoints::new("http://registry");
        IdentityResolver::new(&fetcher, &endpoints, 1000)
            .resolve(Period::new(2025, 6).unwrap(), 1)
    }

    fn registry_rows() -> Vec<Value> {
        vec![
            json!({ "CodInst": "100", "NomeInstituicao": "Banco A", "AnoMes": 202506, "TipoInstituicao": 1 }),
            json!({ "CodIF": 200, "Nome": "Banco B", "AnoMes": 202506, "TipoInstituicao": 1 }),
            json!({ "CodInst": "300", "NomeInstituicao": "Banco C", "AnoMes": 202503, "TipoInstituicao": 1 }),
            json!({ "CodInst": "400", "NomeInstituicao": "Coop D", "AnoMes": 202506, "TipoInstituicao": 2 }),
            json!({ "CodInst": "500" }),
        ]
    }

    #[test]
    fn candidate_keys_resolve_ids_and_names() {
        let map = IdentityMap::from_rows(&registry_rows());
        assert_eq!(map.name_of("100"), "Banco A");
        assert_eq!(map.name_of("200"), "Banco B");
        assert_eq!(map.name_of("500"), "");
        assert_eq!(map.name_of("unknown"), "");
    }

    #[test]
    fn last_name_for_an_id_wins() {
        let rows = vec![
            json!({ "CodInst": "1", "Nome": "First" }),
            json!({ "CodInst": "1", "Nome": "Second" }),
            json!({ "CodInst": "1" }),
        ];
        assert_eq!(IdentityMap::from_rows(&rows).name_of("1"), "Second");
    }

    #[test]
    fn rejected_filter_falls_back_to_client_side_filtering() {
        let map = resolve(Registry {
            reject_filter: true,
            fail_everything: false,
            rows: registry_rows(),
        });
        assert_eq!(map.name_of("100"), "Banco A");
        assert_eq!(map.name_of("200"), "Banco B");
        // Other period and other entity type are filtered out
        assert_eq!(map.name_of("300"), "");
        assert_eq!(map.name_of("400"), "");
    }

    #[test]
    fn failed_scan_yields_empty_map() {
        let map = resolve(Registry {
            reject_filter: false,
            fail_everything: true,
            rows: registry_rows(),
        });
        assert!(map.is_empty());
    }
}

//! Shared fixtures: an in-process IF.data upstream with injectable faults,
//! and a sink that fails after a fixed number of commits.

#![allow(dead_code)]

use ifrisk_core::data::{
    Endpoints, HttpResponse, ResilientFetcher, RetryPolicy, TimeoutTiers, Transport,
    TransportError,
};
use ifrisk_core::domain::{CanonicalMetricSet, Period, RawFact, RiskAssessment};
use ifrisk_core::store::{FactStore, MemoryStore, StoreError};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const BASE: &str = "http://fake.local/odata";

pub fn period(year: i32, month: u32) -> Period {
    Period::new(year, month).unwrap()
}

/// Injected upstream misbehaviour.
#[derive(Debug, Default, Clone)]
pub struct Faults {
    /// Time out any data request whose page size exceeds this.
    pub timeout_above_top: Option<usize>,
    /// Every data request for these reports times out.
    pub timeout_reports: BTreeSet<String>,
    /// Every data request for these reports gets HTTP 400.
    pub reject_reports: BTreeSet<String>,
    /// The function endpoint returns no rows for these reports.
    pub function_empty_reports: BTreeSet<String>,
    /// Number of upcoming requests answered with HTTP 503.
    pub transient_failures: u32,
    /// Data requests from this (0-based) index on time out.
    pub timeout_from_request: Option<usize>,
    /// Registry `$filter` gets HTTP 400.
    pub reject_registry_filter: bool,
    /// The entity set only answers this report clause, e.g. `Relatorio eq 1`.
    pub accepted_report_clause: Option<String>,
    /// Other report clauses get HTTP 400 instead of an empty page.
    pub reject_other_clauses: bool,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub url: String,
    pub query: Vec<(String, String)>,
}

impl Request {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

type TableKey = (u32, u32, String);

pub struct FakeUpstream {
    tables: BTreeMap<TableKey, Vec<Value>>,
    registry: Vec<Value>,
    faults: Mutex<Faults>,
    log: Mutex<Vec<Request>>,
    data_requests: AtomicUsize,
}

impl FakeUpstream {
    pub fn new() -> Self {
        Self {
            tables: BTreeMap::new(),
            registry: Vec::new(),
            faults: Mutex::new(Faults::default()),
            log: Mutex::new(Vec::new()),
            data_requests: AtomicUsize::new(0),
        }
    }

    pub fn with_table(mut self, period: Period, entity_type: u32, report: &str, rows: Vec<Value>) -> Self {
        self.tables
            .insert((period.anomes(), entity_type, report.to_string()), rows);
        self
    }

    pub fn with_registry(mut self, rows: Vec<Value>) -> Self {
        self.registry = rows;
        self
    }

    pub fn with_faults(self, faults: Faults) -> Self {
        *self.faults.lock().unwrap() = faults;
        self
    }

    pub fn set_faults(&self, faults: Faults) {
        *self.faults.lock().unwrap() = faults;
        self.data_requests.store(0, Ordering::SeqCst);
    }

    pub fn clear_faults(&self) {
        self.set_faults(Faults::default());
    }

    pub fn requests(&self) -> Vec<Request> {
        self.log.lock().unwrap().clone()
    }

    /// Data requests (function or entity set) for one report.
    pub fn report_requests(&self, report: &str) -> Vec<Request> {
        self.requests()
            .into_iter()
            .filter(|r| request_report(r).as_deref() == Some(report))
            .collect()
    }

    pub fn endpoints(&self) -> Endpoints {
        Endpoints::new(BASE)
    }

    fn data_fault(&self, report: &str, top: usize) -> Option<Result<HttpResponse, TransportError>> {
        let faults = self.faults.lock().unwrap();
        let index = self.data_requests.fetch_add(1, Ordering::SeqCst);
        if faults.reject_reports.contains(report) {
            return Some(Ok(HttpResponse::status(400, "Bad Request: invalid report")));
        }
        let timed_out = faults.timeout_reports.contains(report)
            || faults.timeout_above_top.is_some_and(|max| top > max)
            || faults.timeout_from_request.is_some_and(|from| index >= from);
        if timed_out {
            return Some(Err(TransportError::Timeout("read timed out".into())));
        }
        None
    }

    fn page(&self, key: &TableKey, offset: usize, top: usize, linked: bool) -> HttpResponse {
        let rows = self.tables.get(key).map(Vec::as_slice).unwrap_or(&[]);
        let end = (offset + top).min(rows.len());
        let page: Vec<Value> = rows.get(offset..end).unwrap_or(&[]).to_vec();
        let mut body = json!({ "value": page });
        if linked && end < rows.len() {
            body["@odata.nextLink"] = json!(format!(
                "{BASE}/IfDataValores?$skiptoken={}:{}:{}:{}:{}",
                key.0, key.1, key.2, end, top
            ));
        }
        HttpResponse::ok(body.to_string())
    }
}

fn param<'a>(query: &'a [(String, String)], name: &str) -> Option<&'a str> {
    query
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

/// Value of `field eq <value>` inside an OData `$filter`.
fn filter_value(filter: &str, field: &str) -> Option<String> {
    let start = filter.find(&format!("{field} eq "))? + field.len() + 4;
    let rest = &filter[start..];
    let end = rest.find(" and ").unwrap_or(rest.len());
    Some(rest[..end].trim().trim_matches('\'').to_string())
}

fn request_report(r: &Request) -> Option<String> {
    if let Some(token) = r.url.split("$skiptoken=").nth(1) {
        return token.split(':').nth(2).map(str::to_string);
    }
    if let Some(rel) = r.param("@Relatorio") {
        return Some(rel.trim_matches('\'').to_string());
    }
    r.param("$filter").and_then(report_in_filter)
}

fn report_in_filter(filter: &str) -> Option<String> {
    filter_value(filter, "NumeroRelatorio").or_else(|| filter_value(filter, "Relatorio"))
}

impl Transport for FakeUpstream {
    fn get(
        &self,
        url: &str,
        query: &[(String, String)],
        _timeouts: &TimeoutTiers,
    ) -> Result<HttpResponse, TransportError> {
        self.log.lock().unwrap().push(Request {
            url: url.to_string(),
            query: query.to_vec(),
        });
        {
            let mut faults = self.faults.lock().unwrap();
            if faults.transient_failures > 0 {
                faults.transient_failures -= 1;
                return Ok(HttpResponse::status(503, "Service Unavailable"));
            }
        }
        let num = |name: &str| param(query, name).and_then(|v| v.parse::<usize>().ok());

        // Registry
        if url.contains("IfDataCadastro") {
            let filtered = param(query, "$filter");
            if filtered.is_some() && self.faults.lock().unwrap().reject_registry_filter {
                return Ok(HttpResponse::status(400, "filter not supported here"));
            }
            let anomes = param(query, "@AnoMes").map(str::to_string);
            let tipo = filtered.and_then(|f| filter_value(f, "TipoInstituicao"));
            let rows: Vec<Value> = self
                .registry
                .iter()
                .filter(|row| {
                    let matches = |field: &str, want: &Option<String>| match (want, row.get(field)) {
                        (Some(w), Some(v)) => v.to_string().trim_matches('"') == w.as_str(),
                        _ => true,
                    };
                    matches("AnoMes", &anomes) && matches("TipoInstituicao", &tipo)
                })
                .skip(num("$skip").unwrap_or(0))
                .take(num("$top").unwrap_or(usize::MAX))
                .cloned()
                .collect();
            return Ok(HttpResponse::ok(json!({ "value": rows }).to_string()));
        }

        // Next link of the entity set
        if let Some(token) = url.split("$skiptoken=").nth(1) {
            let parts: Vec<&str> = token.split(':').collect();
            let key: TableKey = (parts[0].parse().unwrap(), parts[1].parse().unwrap(), parts[2].to_string());
            let offset: usize = parts[3].parse().unwrap();
            let top: usize = parts[4].parse().unwrap();
            if let Some(fault) = self.data_fault(&key.2, top) {
                return fault;
            }
            return Ok(self.page(&key, offset, top, true));
        }

        // Parameterised function
        if url.ends_with("Relatorio=@Relatorio)") {
            let anomes = num("@AnoMes").unwrap() as u32;
            let tipo = num("@TipoInstituicao").unwrap() as u32;
            let report = param(query, "@Relatorio").unwrap().trim_matches('\'').to_string();
            let top = num("$top").unwrap_or(usize::MAX);
            if let Some(fault) = self.data_fault(&report, top) {
                return fault;
            }
            if self.faults.lock().unwrap().function_empty_reports.contains(&report) {
                return Ok(HttpResponse::ok(r#"{"value": []}"#));
            }
            return Ok(self.page(&(anomes, tipo, report), num("$skip").unwrap_or(0), top, false));
        }

        // Filtered entity set, first page
        if url.ends_with("/IfDataValores") {
            let filter = param(query, "$filter").unwrap_or_default();
            let anomes: u32 = filter_value(filter, "AnoMes").unwrap().parse().unwrap();
            let tipo: u32 = filter_value(filter, "TipoInstituicao").unwrap().parse().unwrap();
            let report = report_in_filter(filter).unwrap();
            let top = num("$top").unwrap_or(usize::MAX);
            if let Some(fault) = self.data_fault(&report, top) {
                return fault;
            }
            {
                let faults = self.faults.lock().unwrap();
                let clause = filter.rsplit(" and ").next().unwrap_or_default();
                if faults.accepted_report_clause.as_deref().is_some_and(|c| c != clause) {
                    if faults.reject_other_clauses {
                        return Ok(HttpResponse::status(400, "Bad Request: type mismatch in $filter"));
                    }
                    return Ok(HttpResponse::ok(r#"{"value": []}"#));
                }
            }
            return Ok(self.page(&(anomes, tipo, report), 0, top, true));
        }

        Ok(HttpResponse::status(404, "no such resource"))
    }
}

pub fn fetcher(upstream: &Arc<FakeUpstream>) -> ResilientFetcher {
    ResilientFetcher::new(
        upstream.clone(),
        RetryPolicy::immediate(2),
        TimeoutTiers::default(),
    )
}

/// `n` rows for `report`; every tenth row (index 9, 19, ...) has an
/// unparseable value.
pub fn numbered_rows(report: &str, n: usize) -> Vec<Value> {
    (0..n)
        .map(|i| {
            let saldo = if i % 10 == 9 {
                json!("n/d")
            } else {
                json!(format!("{},{}", 1 + i, i % 10))
            };
            json!({
                "CodInst": format!("{}", 100 + i % 7),
                "NomeColuna": format!("Indicador {report}-{i:03}"),
                "Saldo": saldo,
                "NumeroRelatorio": report,
            })
        })
        .collect()
}

/// Rows of `numbered_rows(_, n)` that become facts.
pub fn good_rows(n: usize) -> usize {
    n - (n + 1) / 10
}

/// Delegates to a `MemoryStore` and fails every fact upsert after the first
/// `allowed` ones.
pub struct FlakySink<'a> {
    inner: &'a MemoryStore,
    allowed: AtomicUsize,
}

impl<'a> FlakySink<'a> {
    pub fn new(inner: &'a MemoryStore, allowed: usize) -> Self {
        Self {
            inner,
            allowed: AtomicUsize::new(allowed),
        }
    }
}

impl FactStore for FlakySink<'_> {
    fn upsert_raw_facts(&self, facts: &[RawFact]) -> Result<(), StoreError> {
        let left = self.allowed.load(Ordering::SeqCst);
        if left == 0 {
            return Err(StoreError::Unavailable("connection reset".into()));
        }
        self.allowed.store(left - 1, Ordering::SeqCst);
        self.inner.upsert_raw_facts(facts)
    }

    fn raw_facts(&self, period: Period) -> Result<Vec<RawFact>, StoreError> {
        self.inner.raw_facts(period)
    }

    fn upsert_metric_sets(&self, sets: &[CanonicalMetricSet]) -> Result<(), StoreError> {
        self.inner.upsert_metric_sets(sets)
    }

    fn metric_sets(&self, period: Period) -> Result<Vec<CanonicalMetricSet>, StoreError> {
        self.inner.metric_sets(period)
    }

    fn upsert_assessments(&self, assessments: &[RiskAssessment]) -> Result<(), StoreError> {
        self.inner.upsert_assessments(assessments)
    }

    fn assessments(&self, period: Period) -> Result<Vec<RiskAssessment>, StoreError> {
        self.inner.assessments(period)
    }
}

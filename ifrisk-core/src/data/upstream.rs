//! IF.data OData endpoints, query construction and row field access.
//!
//! Endpoint shapes:
//! - `IfDataValores(AnoMes=@AnoMes,TipoInstituicao=@TipoInstituicao,Relatorio=@Relatorio)`:
//!   parameterised function, offset pagination.
//! - `IfDataValores` entity set with `$filter`: link pagination.
//! - `IfDataCadastro(AnoMes=@AnoMes)` / `IfDataCadastro`: institution registry.

use super::fetcher::ResilientFetcher;
use super::paging::{LinkPaging, OffsetPaging, PageSource, PaginationMode};
use crate::domain::Period;
use chrono::NaiveDate;
use serde_json::Value;
use tracing::{debug, info, warn};

pub const DEFAULT_BASE_URL: &str = "https://olinda.bcb.gov.br/olinda/servico/IFDATA/versao/v1/odata";

/// Row field names in `IfDataValores`.
pub const FIELD_ENTITY_ID: &str = "CodInst";
pub const FIELD_LABEL: &str = "NomeColuna";
pub const FIELD_VALUE: &str = "Saldo";
pub const FIELD_REPORT: &str = "NumeroRelatorio";
pub const FIELD_REPORT_ALT: &str = "Relatorio";

/// Registry fields that may carry the period and entity type.
pub const FIELD_PERIOD: &str = "AnoMes";
pub const FIELD_ENTITY_TYPE: &str = "TipoInstituicao";

/// Endpoint builder for one OData service root.
#[derive(Debug, Clone)]
pub struct Endpoints {
    base: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl Endpoints {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn valores_function_url(&self) -> String {
        format!(
            "{}/IfDataValores(AnoMes=@AnoMes,TipoInstituicao=@TipoInstituicao,Relatorio=@Relatorio)",
            self.base
        )
    }

    fn valores_entity_set_url(&self) -> String {
        format!("{}/IfDataValores", self.base)
    }

    fn cadastro_function_url(&self) -> String {
        format!("{}/IfDataCadastro(AnoMes=@AnoMes)", self.base)
    }

    fn cadastro_entity_set_url(&self) -> String {
        format!("{}/IfDataCadastro", self.base)
    }

    /// Page source for one report in the given pagination mode.
    pub fn report_source(&self, query: &ReportQuery, mode: PaginationMode) -> Box<dyn PageSource> {
        match mode {
            PaginationMode::Offset => Box::new(OffsetPaging::new(
                self.valores_function_url(),
                query.function_params(),
            )),
            PaginationMode::Link => Box::new(LinkPaging::with_variants(
                self.valores_entity_set_url(),
                query.filter_variants(),
            )),
        }
    }

    /// Registry listing filtered server-side to one period and entity type.
    pub fn registry_filtered(&self, period: Period, entity_type: u32) -> OffsetPaging {
        OffsetPaging::new(
            self.cadastro_function_url(),
            vec![
                format_json(),
                ("@AnoMes".into(), period.anomes().to_string()),
                ("$filter".into(), format!("{FIELD_ENTITY_TYPE} eq {entity_type}")),
            ],
        )
    }

    /// Whole registry, every period and type.
    pub fn registry_unfiltered(&self) -> OffsetPaging {
        OffsetPaging::new(self.cadastro_entity_set_url(), vec![format_json()])
    }
}

fn format_json() -> (String, String) {
    ("$format".into(), "json".into())
}

/// One (period, entity type, report) download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportQuery {
    pub period: Period,
    pub entity_type: u32,
    pub report_id: String,
}

impl ReportQuery {
    pub fn new(period: Period, entity_type: u32, report_id: &str) -> Self {
        Self {
            period,
            entity_type,
            report_id: sanitize_report_id(report_id),
        }
    }

    fn function_params(&self) -> Vec<(String, String)> {
        vec![
            format_json(),
            ("@AnoMes".into(), self.period.anomes().to_string()),
            ("@TipoInstituicao".into(), self.entity_type.to_string()),
            ("@Relatorio".into(), format!("'{}'", self.report_id)),
        ]
    }

    /// `$filter` forms for the entity set, in the order they are tried: the
    /// report field is numeric on some deployments and named `Relatorio` on
    /// others.
    fn filter_variants(&self) -> Vec<Vec<(String, String)>> {
        let scope = format!(
            "{FIELD_PERIOD} eq {} and {FIELD_ENTITY_TYPE} eq {}",
            self.period.anomes(),
            self.entity_type
        );
        let id = &self.report_id;
        [
            format!("{FIELD_REPORT} eq {id}"),
            format!("{FIELD_REPORT} eq '{id}'"),
            format!("{FIELD_REPORT_ALT} eq {id}"),
            format!("{FIELD_REPORT_ALT} eq '{id}'"),
        ]
        .into_iter()
        .map(|clause| vec![format_json(), ("$filter".into(), format!("{scope} and {clause}"))])
        .collect()
    }
}

/// Report ids go inside quoted OData literals; strip quotes and whitespace.
pub fn sanitize_report_id(report_id: &str) -> String {
    report_id.trim().replace('\'', "")
}

/// Render a scalar cell as trimmed text. Numbers keep their JSON form.
pub fn scalar_text(value: Option<&Value>) -> Option<String> {
    let text = match value? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// First non-empty scalar among `keys`.
pub fn first_field(row: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| scalar_text(row.get(*k)))
}

/// Find the most recent (period, entity type) with published data.
///
/// Walks quarter-ends backwards from `today`, each entity type in order,
/// with a one-row page of `sample_report`. Errors on a combination are logged
/// and the search moves on.
pub fn detect_latest_period(
    fetcher: &ResilientFetcher,
    endpoints: &Endpoints,
    sample_report: &str,
    entity_types: &[u32],
    today: NaiveDate,
    quarters: usize,
) -> Option<(Period, u32)> {
    for period in Period::recent_quarter_ends(today, quarters) {
        for &entity_type in entity_types {
            let query = ReportQuery::new(period, entity_type, sample_report);
            let source = endpoints.report_source(&query, PaginationMode::Offset);
            match source.fetch_page(fetcher, &source.start(), 1) {
                Ok(page) if !page.rows.is_empty() => {
                    info!(%period, entity_type, "latest published period detected");
                    return Some((period, entity_type));
                }
                Ok(_) => debug!(%period, entity_type, "no rows published"),
                Err(e) => warn!(%period, entity_type, error = %e, "latest-period request failed"),
            }
        }
    }
    None
}

use axum::{
    Router,
    extract::{Json, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::core::{
    AccountBalances, Answer, Assumptions, BenefitElections, BundledTaxData, CalculationResults,
    Contributions, EngineError, ExpensePlan, IncomeSources, Region, ScenarioInputs, SpendingLevel,
    TaxDataProvider, TaxTables, VariantSpec, build_variant, project_with_tables, run_projection,
    validate_inputs,
};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "nestplan",
    about = "Deterministic retirement projection (RRSP/RRIF + TFSA + non-registered, CPP/OAS, income tax)"
)]
struct Cli {
    #[arg(long)]
    current_age: u32,
    #[arg(long, help = "Age at which work income and contributions stop")]
    exit_age: u32,
    #[arg(long, default_value_t = 95, help = "Last age projected")]
    horizon_age: u32,
    #[arg(long, default_value_t = 2024, help = "Calendar year of the first projected age")]
    start_year: u32,
    #[arg(long, default_value = "ON", help = "Province or territory code, e.g. ON, BC")]
    region: Region,
    #[arg(long, default_value_t = 0.0, help = "RRSP/RRIF balance")]
    deferred_balance: f64,
    #[arg(long, default_value_t = 0.0, help = "TFSA balance")]
    tax_free_balance: f64,
    #[arg(long, default_value_t = 0.0, help = "Non-registered balance")]
    taxable_balance: f64,
    #[arg(
        long,
        help = "Non-registered cost basis; without it half of each withdrawal is treated as gain"
    )]
    taxable_cost_basis: Option<f64>,
    #[arg(long, default_value_t = 0.0)]
    deferred_contribution: f64,
    #[arg(long, default_value_t = 0.0)]
    tax_free_contribution: f64,
    #[arg(long, default_value_t = 0.0)]
    taxable_contribution: f64,
    #[arg(
        long,
        default_value_t = 0.0,
        help = "Annual growth of all contributions in percent"
    )]
    contribution_growth_rate: f64,
    #[arg(
        long,
        default_value_t = 0.0,
        help = "Employer pension per year in today's dollars"
    )]
    pension_annual_income: f64,
    #[arg(long, help = "Pension start age, defaults to --exit-age")]
    pension_start_age: Option<u32>,
    #[arg(
        long,
        default_value_t = 0.0,
        help = "Pension indexation once in payment, in percent"
    )]
    pension_indexation: f64,
    #[arg(
        long,
        default_value_t = 0.0,
        help = "Other taxable income per year in today's dollars, from exit"
    )]
    other_annual_income: f64,
    #[arg(long, help = "Age at which other income stops")]
    other_income_end_age: Option<u32>,
    #[arg(long, default_value_t = 0.0, help = "Monthly spending in today's dollars")]
    monthly_expenses: f64,
    #[arg(
        long = "expense-level",
        value_name = "AGE:MONTHLY",
        value_parser = parse_expense_level,
        help = "Phased spending level; repeat for each phase, overrides --monthly-expenses"
    )]
    expense_levels: Vec<SpendingLevel>,
    #[arg(
        long,
        default_value_t = 6.0,
        help = "Annual return before exit in percent"
    )]
    pre_exit_return: f64,
    #[arg(
        long,
        default_value_t = 4.5,
        help = "Annual return after exit in percent"
    )]
    post_exit_return: f64,
    #[arg(long, default_value_t = 2.0, help = "Annual inflation in percent")]
    inflation_rate: f64,
    #[arg(long, default_value_t = 65)]
    cpp_start_age: u32,
    #[arg(long, default_value_t = 65)]
    oas_start_age: u32,
    #[arg(
        long,
        default_value_t = 100.0,
        help = "Share of the maximum CPP pension earned, in percent"
    )]
    cpp_entitlement: f64,
    #[arg(
        long,
        default_value_t = 100.0,
        help = "Share of the full OAS pension from residency, in percent"
    )]
    oas_entitlement: f64,
}

fn parse_expense_level(raw: &str) -> Result<SpendingLevel, String> {
    let (age, monthly) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected AGE:MONTHLY, got {raw:?}"))?;
    let from_age = age
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("invalid age in {raw:?}: {e}"))?;
    let monthly = monthly
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("invalid monthly amount in {raw:?}: {e}"))?;
    Ok(SpendingLevel { from_age, monthly })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ProjectPayload {
    current_age: Option<u32>,
    exit_age: Option<u32>,
    horizon_age: Option<u32>,
    start_year: Option<u32>,
    region: Option<Region>,

    // Omitted keeps the default, null means the person has none.
    deferred_balance: Answer<f64>,
    tax_free_balance: Answer<f64>,
    taxable_balance: Answer<f64>,
    taxable_cost_basis: Answer<f64>,

    deferred_contribution: Answer<f64>,
    tax_free_contribution: Answer<f64>,
    taxable_contribution: Answer<f64>,
    contribution_growth: Option<f64>,

    pension_income: Answer<f64>,
    pension_start_age: Option<u32>,
    pension_indexation: Option<f64>,
    other_income: Answer<f64>,
    other_income_end_age: Option<u32>,

    monthly_expenses: Option<f64>,
    expense_levels: Option<Vec<SpendingLevel>>,

    pre_exit_return: Option<f64>,
    post_exit_return: Option<f64>,
    inflation: Option<f64>,

    cpp_start_age: Option<u32>,
    oas_start_age: Option<u32>,
    cpp_entitlement: Option<f64>,
    oas_entitlement: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ComparePayload {
    baseline: ProjectPayload,
    variants: Vec<VariantSpec>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct TablesQuery {
    region: Option<String>,
    year: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProjectResponse {
    inputs: ScenarioInputs,
    results: CalculationResults,
}

/// Headline figures for side-by-side comparison.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScenarioSummary {
    final_balance: f64,
    retirement_balance: f64,
    depletion_age: Option<u32>,
    sustainable: bool,
    lifetime_tax: f64,
    lifetime_withdrawals: f64,
    first_year_after_tax_income: f64,
}

impl From<&CalculationResults> for ScenarioSummary {
    fn from(results: &CalculationResults) -> Self {
        Self {
            final_balance: results.final_balance,
            retirement_balance: results.retirement_balance,
            depletion_age: results.depletion_age,
            sustainable: results.sustainable,
            lifetime_tax: results.lifetime_tax,
            lifetime_withdrawals: results.lifetime_withdrawals,
            first_year_after_tax_income: results.first_year_after_tax_income,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VariantOutcome {
    label: String,
    variant: VariantSpec,
    summary: Option<ScenarioSummary>,
    final_balance_change: Option<f64>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompareResponse {
    baseline: ScenarioSummary,
    variants: Vec<VariantOutcome>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match err {
            EngineError::InvalidScenario(_) => StatusCode::BAD_REQUEST,
            EngineError::TaxData(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

#[derive(Clone)]
struct AppState {
    provider: Arc<dyn TaxDataProvider + Send + Sync>,
}

fn build_inputs(cli: Cli) -> Result<ScenarioInputs, String> {
    if cli.exit_age <= cli.current_age {
        return Err("--exit-age must be > --current-age".to_string());
    }

    if cli.horizon_age <= cli.exit_age {
        return Err("--horizon-age must be > --exit-age".to_string());
    }

    for (name, amount) in [
        ("--deferred-balance", cli.deferred_balance),
        ("--tax-free-balance", cli.tax_free_balance),
        ("--taxable-balance", cli.taxable_balance),
        ("--deferred-contribution", cli.deferred_contribution),
        ("--tax-free-contribution", cli.tax_free_contribution),
        ("--taxable-contribution", cli.taxable_contribution),
        ("--pension-annual-income", cli.pension_annual_income),
        ("--other-annual-income", cli.other_annual_income),
        ("--monthly-expenses", cli.monthly_expenses),
    ] {
        if !amount.is_finite() || amount < 0.0 {
            return Err(format!("{name} must be >= 0"));
        }
    }

    if let Some(basis) = cli.taxable_cost_basis {
        if !basis.is_finite() || basis < 0.0 || basis > cli.taxable_balance {
            return Err("--taxable-cost-basis must be between 0 and --taxable-balance".to_string());
        }
    }

    for (name, rate) in [
        ("--contribution-growth-rate", cli.contribution_growth_rate),
        ("--pension-indexation", cli.pension_indexation),
        ("--pre-exit-return", cli.pre_exit_return),
        ("--post-exit-return", cli.post_exit_return),
        ("--inflation-rate", cli.inflation_rate),
    ] {
        if !rate.is_finite() || rate <= -100.0 {
            return Err(format!("{name} must be > -100"));
        }
    }

    if !(0.0..=100.0).contains(&cli.cpp_entitlement) {
        return Err("--cpp-entitlement must be between 0 and 100".to_string());
    }

    if !(0.0..=100.0).contains(&cli.oas_entitlement) {
        return Err("--oas-entitlement must be between 0 and 100".to_string());
    }

    if let Some(end_age) = cli.other_income_end_age {
        if end_age <= cli.exit_age {
            return Err("--other-income-end-age must be > --exit-age".to_string());
        }
    }

    let expenses = if cli.expense_levels.is_empty() {
        ExpensePlan::FixedMonthly(cli.monthly_expenses)
    } else {
        let mut levels = cli.expense_levels;
        levels.sort_by_key(|level| level.from_age);
        if levels.windows(2).any(|w| w[0].from_age == w[1].from_age) {
            return Err("--expense-level ages must be distinct".to_string());
        }
        ExpensePlan::Phased(levels)
    };

    let inputs = ScenarioInputs {
        current_age: cli.current_age,
        exit_age: cli.exit_age,
        horizon_age: cli.horizon_age,
        start_year: cli.start_year,
        region: cli.region,
        balances: AccountBalances::new(
            cli.deferred_balance,
            cli.tax_free_balance,
            cli.taxable_balance,
        ),
        taxable_cost_basis: cli.taxable_cost_basis,
        contributions: Contributions {
            deferred: cli.deferred_contribution,
            tax_free: cli.tax_free_contribution,
            taxable: cli.taxable_contribution,
            growth_rate: cli.contribution_growth_rate / 100.0,
        },
        income: IncomeSources {
            pension_annual: cli.pension_annual_income,
            pension_start_age: cli.pension_start_age.unwrap_or(cli.exit_age),
            pension_indexation: cli.pension_indexation / 100.0,
            other_annual: cli.other_annual_income,
            other_end_age: cli.other_income_end_age,
        },
        expenses,
        assumptions: Assumptions {
            pre_exit_return: cli.pre_exit_return / 100.0,
            post_exit_return: cli.post_exit_return / 100.0,
            inflation: cli.inflation_rate / 100.0,
        },
        benefits: BenefitElections {
            cpp_start_age: cli.cpp_start_age,
            oas_start_age: cli.oas_start_age,
            cpp_entitlement: cli.cpp_entitlement / 100.0,
            oas_entitlement: cli.oas_entitlement / 100.0,
        },
    };

    validate_inputs(&inputs).map_err(|e| e.to_string())?;
    Ok(inputs)
}

/// Parses `project` subcommand flags, runs the projection against the bundled
/// tables and returns it as pretty JSON.
pub fn run_cli<I, T>(args: I) -> Result<String, String>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = Cli::try_parse_from(args).map_err(|e| e.to_string())?;
    let inputs = build_inputs(cli)?;
    let results = run_projection(&inputs, &BundledTaxData).map_err(|e| e.to_string())?;
    serde_json::to_string_pretty(&ProjectResponse { inputs, results })
        .map_err(|e| format!("failed to encode projection: {e}"))
}

pub fn router(provider: Arc<dyn TaxDataProvider + Send + Sync>) -> Router {
    Router::new()
        .route(
            "/api/project",
            get(project_get_handler).post(project_post_handler),
        )
        .route("/api/compare", post(compare_handler))
        .route("/api/tables", get(tables_handler))
        .fallback(not_found_handler)
        .with_state(AppState { provider })
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router(Arc::new(BundledTaxData));

    let listener = TcpListener::bind(addr).await?;
    info!("nestplan HTTP API listening on http://{addr}");
    info!("Local access: http://127.0.0.1:{port}/api/project");

    axum::serve(listener, app).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn project_get_handler(
    State(state): State<AppState>,
    Query(payload): Query<ProjectPayload>,
) -> Response {
    respond(project_from_payload(payload, state.provider.as_ref()))
}

async fn project_post_handler(
    State(state): State<AppState>,
    Json(payload): Json<ProjectPayload>,
) -> Response {
    respond(project_from_payload(payload, state.provider.as_ref()))
}

async fn compare_handler(
    State(state): State<AppState>,
    Json(payload): Json<ComparePayload>,
) -> Response {
    respond(compare_from_payload(payload, state.provider.as_ref()))
}

async fn tables_handler(
    State(state): State<AppState>,
    Query(query): Query<TablesQuery>,
) -> Response {
    respond(tables_from_query(query, state.provider.as_ref()))
}

fn respond<T: Serialize>(result: Result<T, ApiError>) -> Response {
    match result {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(err) => {
            warn!("request rejected ({}): {}", err.status, err.message);
            error_response(err.status, &err.message)
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    with_cache_control((status, Json(body)))
}

fn with_cache_control<R: IntoResponse>(response: R) -> Response {
    let mut response = response.into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

fn project_from_payload(
    payload: ProjectPayload,
    provider: &dyn TaxDataProvider,
) -> Result<ProjectResponse, ApiError> {
    let inputs = inputs_from_payload(payload).map_err(ApiError::bad_request)?;
    info!(
        "projecting {} from age {} to {} (exit at {})",
        inputs.region, inputs.current_age, inputs.horizon_age, inputs.exit_age
    );
    let results = run_projection(&inputs, provider)?;
    Ok(ProjectResponse { inputs, results })
}

/// Runs the baseline and every variant against one table snapshot. A variant
/// that fails validation is reported in place; the baseline failing rejects
/// the whole request.
fn compare_from_payload(
    payload: ComparePayload,
    provider: &dyn TaxDataProvider,
) -> Result<CompareResponse, ApiError> {
    let baseline = inputs_from_payload(payload.baseline).map_err(ApiError::bad_request)?;
    let tables = TaxTables::load(provider, baseline.region, baseline.start_year)
        .map_err(EngineError::from)?;
    let baseline_results = project_with_tables(&baseline, &tables);
    info!(
        "comparing {} variant(s) against a {} baseline",
        payload.variants.len(),
        baseline.region
    );

    let variants = payload
        .variants
        .into_iter()
        .map(|spec| {
            let inputs = build_variant(&baseline, &variant_rates_as_ratios(&spec));
            let label = spec.label();
            match validate_inputs(&inputs) {
                Ok(()) => {
                    let results = project_with_tables(&inputs, &tables);
                    VariantOutcome {
                        label,
                        variant: spec,
                        final_balance_change: Some(
                            results.final_balance - baseline_results.final_balance,
                        ),
                        summary: Some(ScenarioSummary::from(&results)),
                        error: None,
                    }
                }
                Err(err) => VariantOutcome {
                    label,
                    variant: spec,
                    summary: None,
                    final_balance_change: None,
                    error: Some(err.to_string()),
                },
            }
        })
        .collect();

    Ok(CompareResponse {
        baseline: ScenarioSummary::from(&baseline_results),
        variants,
    })
}

/// Variant return rates arrive in percent like the baseline payload's; the
/// engine takes ratios.
fn variant_rates_as_ratios(spec: &VariantSpec) -> VariantSpec {
    match spec {
        VariantSpec::Returns {
            pre_exit_return,
            post_exit_return,
        } => VariantSpec::Returns {
            pre_exit_return: pre_exit_return.map(|rate| rate / 100.0),
            post_exit_return: post_exit_return.map(|rate| rate / 100.0),
        },
        other => other.clone(),
    }
}

fn tables_from_query(
    query: TablesQuery,
    provider: &dyn TaxDataProvider,
) -> Result<TaxTables, ApiError> {
    let region = match query.region.as_deref() {
        Some(code) => code.parse::<Region>().map_err(ApiError::bad_request)?,
        None => Region::On,
    };
    let year = query.year.unwrap_or_else(|| provider.latest_year());
    TaxTables::load(provider, region, year).map_err(|e| ApiError::from(EngineError::from(e)))
}

#[cfg(test)]
fn inputs_from_json(json: &str) -> Result<ScenarioInputs, String> {
    let payload = serde_json::from_str::<ProjectPayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    inputs_from_payload(payload)
}

fn overlay(target: &mut f64, answer: Answer<f64>) {
    *target = answer.amount_or(*target);
}

fn inputs_from_payload(payload: ProjectPayload) -> Result<ScenarioInputs, String> {
    let mut cli = default_cli_for_api();

    if let Some(v) = payload.current_age {
        cli.current_age = v;
    }
    if let Some(v) = payload.exit_age {
        cli.exit_age = v;
    }
    if let Some(v) = payload.horizon_age {
        cli.horizon_age = v;
    }
    if let Some(v) = payload.start_year {
        cli.start_year = v;
    }
    if let Some(v) = payload.region {
        cli.region = v;
    }

    overlay(&mut cli.deferred_balance, payload.deferred_balance);
    overlay(&mut cli.tax_free_balance, payload.tax_free_balance);
    overlay(&mut cli.taxable_balance, payload.taxable_balance);
    match payload.taxable_cost_basis {
        Answer::Unset => {}
        Answer::ExplicitlyNone => cli.taxable_cost_basis = None,
        Answer::Valued(v) => cli.taxable_cost_basis = Some(v),
    }
    // A basis from the defaults cannot exceed a smaller balance sent by the caller.
    if payload.taxable_balance.is_answered() && !payload.taxable_cost_basis.is_answered() {
        cli.taxable_cost_basis = cli
            .taxable_cost_basis
            .map(|basis| basis.min(cli.taxable_balance));
    }

    overlay(&mut cli.deferred_contribution, payload.deferred_contribution);
    overlay(&mut cli.tax_free_contribution, payload.tax_free_contribution);
    overlay(&mut cli.taxable_contribution, payload.taxable_contribution);
    if let Some(v) = payload.contribution_growth {
        cli.contribution_growth_rate = v;
    }

    overlay(&mut cli.pension_annual_income, payload.pension_income);
    if let Some(v) = payload.pension_start_age {
        cli.pension_start_age = Some(v);
    }
    if let Some(v) = payload.pension_indexation {
        cli.pension_indexation = v;
    }
    overlay(&mut cli.other_annual_income, payload.other_income);
    if let Some(v) = payload.other_income_end_age {
        cli.other_income_end_age = Some(v);
    }

    if let Some(v) = payload.monthly_expenses {
        cli.monthly_expenses = v;
    }
    if let Some(v) = payload.expense_levels {
        cli.expense_levels = v;
    }

    if let Some(v) = payload.pre_exit_return {
        cli.pre_exit_return = v;
    }
    if let Some(v) = payload.post_exit_return {
        cli.post_exit_return = v;
    }
    if let Some(v) = payload.inflation {
        cli.inflation_rate = v;
    }

    if let Some(v) = payload.cpp_start_age {
        cli.cpp_start_age = v;
    }
    if let Some(v) = payload.oas_start_age {
        cli.oas_start_age = v;
    }
    if let Some(v) = payload.cpp_entitlement {
        cli.cpp_entitlement = v;
    }
    if let Some(v) = payload.oas_entitlement {
        cli.oas_entitlement = v;
    }

    build_inputs(cli)
}

fn default_cli_for_api() -> Cli {
    Cli {
        current_age: 55,
        exit_age: 62,
        horizon_age: 95,
        start_year: 2024,
        region: Region::On,
        deferred_balance: 400_000.0,
        tax_free_balance: 90_000.0,
        taxable_balance: 60_000.0,
        taxable_cost_basis: Some(45_000.0),
        deferred_contribution: 15_000.0,
        tax_free_contribution: 7_000.0,
        taxable_contribution: 0.0,
        contribution_growth_rate: 2.0,
        pension_annual_income: 0.0,
        pension_start_age: None,
        pension_indexation: 0.0,
        other_annual_income: 0.0,
        other_income_end_age: None,
        monthly_expenses: 5_000.0,
        expense_levels: Vec::new(),
        pre_exit_return: 6.0,
        post_exit_return: 4.5,
        inflation_rate: 2.0,
        cpp_start_age: 65,
        oas_start_age: 65,
        cpp_entitlement: 70.0,
        oas_entitlement: 100.0,
    }
}

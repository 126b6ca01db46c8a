//! Operational endpoints

use axum::extract::State;
use axum::Json;
use subflow_billing::InvariantCheckSummary;

use crate::error::ApiResult;
use crate::state::AppState;

/// Run every data-consistency check and report violations.
pub async fn run_invariants(
    State(state): State<AppState>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let summary = state.billing.invariants.run_all_checks().await?;
    Ok(Json(summary))
}

//! Activity handlers the bundled definitions name.

use pvm_core::handler::{ActivityContext, HandlerError};
use pvm_core::ProcessEngineBuilder;
use serde_json::{json, Value};

pub fn register(builder: ProcessEngineBuilder) -> ProcessEngineBuilder {
    builder
        .handler_fn("score_applicant", score_applicant)
        .handler_fn("kyc_check", kyc_check)
        .handler_fn("sanctions_screen", sanctions_screen)
}

/// Derives `score` from `income` and `debt`. Applicants without an income
/// score zero.
fn score_applicant(ctx: &mut ActivityContext<'_>) -> Result<(), HandlerError> {
    let income = ctx.variable("income").and_then(Value::as_f64).unwrap_or(0.0);
    let debt = ctx.variable("debt").and_then(Value::as_f64).unwrap_or(0.0);
    let score = if income <= 0.0 {
        0
    } else {
        let ratio = (debt / income).clamp(0.0, 1.0);
        (850.0 - ratio * 550.0).round() as i64
    };
    tracing::debug!(execution_id = %ctx.execution_id(), score, "applicant scored");
    ctx.set_variable("score", json!(score))?;
    Ok(())
}

fn kyc_check(ctx: &mut ActivityContext<'_>) -> Result<(), HandlerError> {
    let documents = ctx
        .variable("documents")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    if documents == 0 {
        return Err(HandlerError::business("KYC_INCOMPLETE", "no identity documents"));
    }
    ctx.set_variable("kyc_passed", json!(true))?;
    Ok(())
}

fn sanctions_screen(ctx: &mut ActivityContext<'_>) -> Result<(), HandlerError> {
    let hit = ctx
        .variable("country")
        .and_then(Value::as_str)
        .is_some_and(|c| matches!(c, "KP" | "IR" | "SY"));
    ctx.set_variable("sanctions_hit", json!(hit))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvm_core::store::JobQuery;
    use pvm_core::ProcessEngine;
    use std::collections::BTreeMap;

    const LOAN: &str = include_str!("../definitions/loan.yaml");
    const ONBOARDING: &str = include_str!("../definitions/onboarding.yaml");

    fn engine() -> ProcessEngine {
        let engine = register(ProcessEngine::builder()).build();
        engine.deploy_yaml(LOAN).unwrap();
        engine.deploy_yaml(ONBOARDING).unwrap();
        engine
    }

    #[tokio::test]
    async fn low_ratio_applicant_goes_straight_to_approval() {
        let engine = engine();
        let vars = BTreeMap::from([
            ("income".to_string(), json!(100_000)),
            ("debt".to_string(), json!(5_000)),
        ]);
        let id = engine.start_process("loan", vars).await.unwrap();
        let view = engine.process_instance(id).await.unwrap();
        assert!(view.variables["score"].as_i64().unwrap() >= 700);
        // Parked before `approve` on an async continuation.
        assert_eq!(view.jobs.len(), 1);
    }

    #[tokio::test]
    async fn onboarding_forks_into_two_jobs() {
        let engine = engine();
        engine
            .start_process("onboarding", BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(engine.jobs(JobQuery::default()).await.unwrap().len(), 2);
    }
}

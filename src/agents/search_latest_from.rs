use crate::database::repository::LatestFromParams;
use crate::database::Repository;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Deserialize, Default)]
pub struct LatestFromParamsInput {
    pub sender: Option<String>,
    pub domain: Option<String>,
    pub limit: Option<i64>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub date_window_days: Option<i32>,
}

/// Structured query over the store (4.L). `limit` defaults to 5, capped
/// at 50; `date_window_days` (clamped [1, 365] by the router before it
/// reaches here) converts to an absolute `date_from` when present and
/// no explicit window was given.
pub async fn run(repository: Arc<Repository>, params: Value) -> Value {
    let input: LatestFromParamsInput = match serde_json::from_value(params) {
        Ok(v) => v,
        Err(e) => return json!({"error": format!("invalid params: {e}")}),
    };

    let limit = input.limit.unwrap_or(5).clamp(1, 50);
    let date_from = input.date_from.or_else(|| {
        input
            .date_window_days
            .map(|days| Utc::now() - ChronoDuration::days(days.clamp(1, 365) as i64))
    });

    let query_params = LatestFromParams {
        sender: input.sender,
        domain: input.domain,
        limit,
        date_from,
        date_to: input.date_to,
    };

    match repository.latest_from(&query_params).await {
        Ok(items) => json!({"items": items}),
        Err(e) => json!({"error": e.to_string()}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_defaults_and_clamps() {
        let input: LatestFromParamsInput = serde_json::from_value(json!({"limit": 500})).unwrap();
        assert_eq!(input.limit.unwrap().clamp(1, 50), 50);

        let default_input: LatestFromParamsInput = serde_json::from_value(json!({})).unwrap();
        assert_eq!(default_input.limit.unwrap_or(5).clamp(1, 50), 5);
    }
}

use crate::types::RunResult;
use redis::{AsyncCommands, RedisResult};
use serde::Serialize;

/// Redis result-stream semantics - defines only key layout and payloads
/// Keeps the worker and any downstream reader agreeing on where a run's
/// records and summary live

pub const RESULTS_PREFIX: &str = "modelab:results";
pub const SUMMARY_PREFIX: &str = "modelab:summary";

/// Records and summaries expire after 7 days
pub const RUN_TTL_SECONDS: u64 = 7 * 86400;

/// Generate the list key holding a run's records
pub fn results_key(run_id: &str) -> String {
    format!("{}:{}", RESULTS_PREFIX, run_id)
}

/// Generate the key holding a run's summary document
pub fn summary_key(run_id: &str) -> String {
    format!("{}:{}", SUMMARY_PREFIX, run_id)
}

fn serialization_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
}

/// Append one record to the run's list
/// Uses RPUSH so list order equals completion order
pub async fn push_result(
    conn: &mut redis::aio::ConnectionManager,
    result: &RunResult,
) -> RedisResult<()> {
    let key = results_key(&result.run_id);
    let payload = serde_json::to_string(result).map_err(serialization_error)?;

    let _: () = conn.rpush(&key, payload).await?;
    let _: () = conn.expire(&key, RUN_TTL_SECONDS as _).await?;
    Ok(())
}

/// Fetch every record of a run in completion order
pub async fn fetch_results(
    conn: &mut redis::aio::ConnectionManager,
    run_id: &str,
) -> RedisResult<Vec<RunResult>> {
    let payloads: Vec<String> = conn.lrange(results_key(run_id), 0, -1).await?;

    payloads
        .iter()
        .map(|data| {
            serde_json::from_str(data).map_err(|e| {
                redis::RedisError::from((
                    redis::ErrorKind::TypeError,
                    "deserialization error",
                    e.to_string(),
                ))
            })
        })
        .collect()
}

/// Store the batch summary for a run
pub async fn store_summary<T: Serialize>(
    conn: &mut redis::aio::ConnectionManager,
    run_id: &str,
    summary: &T,
) -> RedisResult<()> {
    let payload = serde_json::to_string(summary).map_err(serialization_error)?;
    let _: () = conn
        .set_ex(summary_key(run_id), payload, RUN_TTL_SECONDS as _)
        .await?;
    Ok(())
}

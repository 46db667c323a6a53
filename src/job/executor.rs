use thiserror::Error;
use tracing::{Instrument, debug, info, info_span, warn};

use super::backoff::{BackoffPolicy, retry_on_error};
use super::client::{ApiRequest, ClientError, ClusterClient};
use super::definition::{ApiCall, ApiMethod, JobDefinition};

#[derive(Error, Debug)]
pub enum CallError {
    #[error("request failed: {0}")]
    Transport(#[from] ClientError),

    #[error("unexpected status code {0}")]
    UnexpectedStatus(u16),
}

/// Terminal failure of one call, after retries if any.
#[derive(Error, Debug)]
#[error("API call {index} ({method} {path}) failed: {source}")]
pub struct CallFailure {
    pub index: usize,
    pub method: ApiMethod,
    pub path: String,
    #[source]
    pub source: CallError,
}

async fn execute<C: ClusterClient>(client: &C, call: &ApiCall) -> Result<u16, CallError> {
    let req = ApiRequest::from(call);
    let resp = client.request(&req).await?;
    if call.is_successful(resp.status) {
        Ok(resp.status)
    } else {
        debug!(
            "Unexpected response body: {}",
            String::from_utf8_lossy(&resp.body)
        );
        Err(CallError::UnexpectedStatus(resp.status))
    }
}

/// Runs the calls of `def` in order and stops at the first one that fails.
pub async fn execute_all<C: ClusterClient>(
    def: &JobDefinition,
    client: &C,
) -> Result<(), CallFailure> {
    let policy = def.backoff();
    for (index, call) in def.api_calls.iter().enumerate() {
        run_call(&policy, client, call)
            .instrument(info_span!(
                "api_call",
                call_seq = index,
                method = %call.method,
                path = %call.path
            ))
            .await
            .map_err(|source| CallFailure {
                index,
                method: call.method,
                path: call.path.clone(),
                source,
            })?;
    }
    Ok(())
}

async fn run_call<C: ClusterClient>(
    policy: &BackoffPolicy,
    client: &C,
    call: &ApiCall,
) -> Result<(), CallError> {
    let status = retry_on_error(policy, |_| call.retry, move || execute(client, call))
        .await
        .inspect_err(|e| warn!("{} {} failed: {}", call.method, call.request_path(), e))?;
    info!(
        "{} {} succeeded with status {}.",
        call.method,
        call.request_path(),
        status
    );
    Ok(())
}

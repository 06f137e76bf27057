use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::{Request, Status};

pub(crate) const CORRELATION_ID_METADATA_KEY: &str = "x-correlation-id";

/// Longer client supplied ids are cut so they stay usable as a log field.
const MAX_CORRELATION_ID_LEN: usize = 128;

static NEXT_CORRELATION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CorrelationId(pub(crate) String);

pub(crate) fn apply(mut request: Request<()>) -> Result<Request<()>, Status> {
    let correlation_id =
        incoming_correlation_id(request.metadata())?.unwrap_or_else(generate_correlation_id);

    let metadata_value: MetadataValue<_> = correlation_id
        .parse()
        .map_err(|_| Status::invalid_argument("invalid `x-correlation-id` header value"))?;
    request
        .metadata_mut()
        .insert(CORRELATION_ID_METADATA_KEY, metadata_value);
    request
        .extensions_mut()
        .insert(CorrelationId(correlation_id));

    super::mark_step(request, "correlation_id")
}

fn incoming_correlation_id(metadata: &MetadataMap) -> Result<Option<String>, Status> {
    let Some(value) = metadata.get(CORRELATION_ID_METADATA_KEY) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| Status::invalid_argument("invalid `x-correlation-id` header value"))?
        .trim();
    if value.is_empty() {
        return Ok(None);
    }

    Ok(Some(value.chars().take(MAX_CORRELATION_ID_LEN).collect()))
}

fn generate_correlation_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_u128, |duration| duration.as_nanos());
    let seq = NEXT_CORRELATION_ID.fetch_add(1, Ordering::Relaxed);
    format!("ops-{now:x}-{seq:x}")
}

//! Request helpers shared by the JSON endpoints

use crate::api::error::ApiError;

/// Accepts `application/json` with or without parameters; rejects lookalikes
/// such as `application/jsonp` or `text/json`
pub fn ensure_json(content_type: &str) -> Result<(), ApiError> {
    let media_type: mime::Mime = content_type
        .parse()
        .map_err(|_| ApiError::InvalidPayload(format!("unparseable Content-Type {content_type:?}")))?;

    if media_type.type_() == mime::APPLICATION && media_type.subtype() == mime::JSON {
        return Ok(());
    }
    Err(ApiError::InvalidPayload(format!(
        "expected application/json, got {}",
        media_type.essence_str()
    )))
}

pub fn validate_body_size(data: &[u8], max_size: usize) -> Result<(), ApiError> {
    if data.len() > max_size {
        return Err(ApiError::PayloadTooLarge(data.len()));
    }
    Ok(())
}

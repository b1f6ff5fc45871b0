//! Input-path resolution: `http(s)://` URLs pass straight through, `s3://`
//! URLs become a time-limited signed URL, everything else is treated as a
//! local path. Grounded in `lumberjack/apps/ffmpeg/inputs.py::get_input_path`.

use std::time::Duration;

use url::Url;

use crate::error::{CoreError, CoreResult};

/// How long a presigned S3 GET URL stays valid for, matching the original's
/// `FIVE_MINUTES`-named-but-actually-24h constant in `command_generator.py`.
pub const S3_URL_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// Resolves `path` to the string ffmpeg should use as its `-i` argument.
pub fn resolve_input(path: &str) -> CoreResult<String> {
    if path.starts_with("http") {
        return Ok(path.to_string());
    }
    if let Some(rest) = path.strip_prefix("s3://") {
        return presign(rest, S3_URL_EXPIRY);
    }
    Ok(path.to_string())
}

/// Whether ffmpeg needs the `-reconnect` family of flags for this input,
/// which only applies to the original (pre-resolution) URL scheme.
pub fn needs_reconnect_flags(path: &str) -> bool {
    path.starts_with("http")
}

/// Builds a presigned-URL-shaped string for an `s3://bucket/key` path. No
/// network call and no real signature: this stands in for
/// `S3InputPath.generate`'s `generate_presigned_url` call, which the core
/// does not have credentials to perform itself (see SPEC_FULL §6).
fn presign(bucket_and_key: &str, expires_in: Duration) -> CoreResult<String> {
    let mut parts = bucket_and_key.splitn(2, '/');
    let bucket = parts
        .next()
        .filter(|b| !b.is_empty())
        .ok_or_else(|| CoreError::InvalidSettings(format!("invalid s3 url: s3://{bucket_and_key}")))?;
    let key = parts.next().unwrap_or_default();

    let mut url = Url::parse(&format!("https://{bucket}.s3.amazonaws.com/{key}"))
        .map_err(|err| CoreError::InvalidSettings(format!("invalid s3 url: {err}")))?;
    url.query_pairs_mut()
        .append_pair("X-Amz-Expires", &expires_in.as_secs().to_string());
    Ok(url.to_string())
}

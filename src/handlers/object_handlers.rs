//! HTTP handlers for object and bucket operations.
//! Streams object bodies in both directions and delegates version resolution
//! to the [`Gateway`](crate::services::gateway::Gateway).

use super::AppState;
use crate::{
    errors::AppError,
    models::{
        bucket::BucketSettings,
        object::{ByteRange, ObjectInfo},
    },
    network::{PayloadStream, check_range},
    services::{
        gateway::{DeleteObjectParams, HeadObjectParams, PutObjectParams},
        listing::{
            ListObjectVersionsInfo, ListObjectVersionsParams, ListObjectsInfo,
            ListObjectsParamsCommon, ListObjectsParamsV1, ListObjectsParamsV2,
        },
        versions::ObjectVersionInfo,
    },
};
use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose};
use chrono::SecondsFormat;
use futures::StreamExt;
use serde::Deserialize;
use std::{collections::BTreeMap, io};
use tokio_util::io::ReaderStream;
use tracing::warn;

const USER_META_PREFIX: &str = "x-amz-meta-";
const MAX_KEYS_LIMIT: usize = 1000;
const GET_BUFFER_SIZE: usize = 64 * 1024;

/// Query params accepted by object routes.
#[derive(Debug, Default, Deserialize)]
pub struct ObjectQuery {
    #[serde(rename = "versionId")]
    pub version_id: Option<String>,
}

/// Query params accepted by bucket routes: listings and the versioning
/// sub-resource.
#[derive(Debug, Default, Deserialize)]
pub struct BucketQuery {
    #[serde(rename = "list-type")]
    pub list_type: Option<u8>,
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    #[serde(rename = "max-keys")]
    pub max_keys: Option<usize>,
    pub marker: Option<String>,
    #[serde(rename = "continuation-token")]
    pub continuation_token: Option<String>,
    #[serde(rename = "start-after")]
    pub start_after: Option<String>,
    pub versions: Option<String>,
    pub versioning: Option<String>,
    #[serde(rename = "key-marker")]
    pub key_marker: Option<String>,
    #[serde(rename = "version-id-marker")]
    pub version_id_marker: Option<String>,
}

/// Minimal request body for `PUT /{bucket}` (create bucket).
#[derive(Debug, Deserialize)]
pub struct CreateBucketReq {
    #[serde(rename = "LocationConstraint")]
    pub location_constraint: Option<String>,
}

/// Request body for `PUT /{bucket}?versioning`.
#[derive(Debug, Deserialize)]
pub struct VersioningReq {
    #[serde(rename = "Status")]
    pub status: String,
}

/// Upload an object to `/{bucket}/{*key}`.
pub async fn upload_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let ctx = state.context(&headers);

    let mut user_headers = BTreeMap::new();
    for (name, value) in headers.iter() {
        let Ok(value) = value.to_str() else {
            continue;
        };
        if *name == header::CONTENT_TYPE {
            user_headers.insert("Content-Type".to_string(), value.to_string());
        } else if let Some(meta) = name.as_str().strip_prefix(USER_META_PREFIX) {
            user_headers.insert(meta.to_string(), value.to_string());
        }
    }

    let payload: PayloadStream = Box::pin(
        body.into_data_stream()
            .map(|chunk| chunk.map_err(io::Error::other)),
    );

    let info = state
        .gateway
        .put_object(
            &ctx,
            PutObjectParams {
                bucket,
                key,
                headers: user_headers,
                payload,
            },
        )
        .await?;

    let mut response = Response::new(Body::empty());
    let resp_headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", info.hash_sum)) {
        resp_headers.insert(header::ETAG, value);
    }
    insert_header(resp_headers, "x-amz-version-id", &info.surfaced_version());
    insert_header(resp_headers, "x-amz-request-id", ctx.request_id());
    *response.status_mut() = StatusCode::OK;
    Ok(response)
}

/// Download an object `/{bucket}/{*key}` as a streaming response.
pub async fn get_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<ObjectQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let ctx = state.context(&headers);
    let info = state
        .gateway
        .head_object(
            &ctx,
            &HeadObjectParams {
                bucket,
                key,
                version_id: q.version_id,
            },
        )
        .await?;
    reject_delete_marker(&info)?;

    let range = match headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        Some(value) => Some(parse_range(value, info.size)?),
        None => None,
    };

    let (mut writer, reader) = tokio::io::duplex(GET_BUFFER_SIZE);
    let gateway = state.gateway.clone();
    let task_ctx = ctx.clone();
    let task_info = info.clone();
    tokio::spawn(async move {
        if let Err(err) = gateway
            .read_payload(&task_ctx, &task_info, range, &mut writer)
            .await
        {
            warn!(
                request_id = task_ctx.request_id(),
                object = %task_info.address(),
                error = %err,
                "payload stream aborted"
            );
        }
    });

    // Dropping the body (client gone) cancels the payload task.
    let guard = ctx.cancellation().clone().drop_guard();
    let body = ReaderStream::new(reader).map(move |chunk| {
        let _keep = &guard;
        chunk
    });

    let mut response = Response::new(Body::from_stream(body));
    set_object_headers(response.headers_mut(), &info, range);
    insert_header(response.headers_mut(), "x-amz-request-id", ctx.request_id());
    *response.status_mut() = if range.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    Ok(response)
}

/// HEAD `/{bucket}/{*key}`: same headers as GET but no body.
pub async fn head_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<ObjectQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let ctx = state.context(&headers);
    let info = state
        .gateway
        .head_object(
            &ctx,
            &HeadObjectParams {
                bucket,
                key,
                version_id: q.version_id,
            },
        )
        .await?;
    reject_delete_marker(&info)?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &info, None);
    insert_header(response.headers_mut(), "x-amz-request-id", ctx.request_id());

    Ok(response)
}

/// DELETE `/{bucket}/{*key}`: write a delete marker, or remove one version
/// when `versionId` is given.
pub async fn delete_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<ObjectQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let ctx = state.context(&headers);
    let result = state
        .gateway
        .delete_object(
            &ctx,
            &DeleteObjectParams {
                bucket,
                key,
                version_id: q.version_id,
            },
        )
        .await?;

    let mut response = Response::new(Body::empty());
    let headers = response.headers_mut();
    if result.delete_marker {
        headers.insert(
            HeaderName::from_static("x-amz-delete-marker"),
            HeaderValue::from_static("true"),
        );
    }
    insert_header(headers, "x-amz-version-id", &result.version_id);
    insert_header(headers, "x-amz-request-id", ctx.request_id());
    *response.status_mut() = StatusCode::NO_CONTENT;
    Ok(response)
}

/// GET `/{bucket}`: V1 or V2 listing, version listing with `?versions`, or
/// the versioning configuration with `?versioning`.
pub async fn list_objects(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Query(q): Query<BucketQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let ctx = state.context(&headers);
    let max_keys = q.max_keys.unwrap_or(MAX_KEYS_LIMIT).min(MAX_KEYS_LIMIT);
    let prefix = q.prefix.clone().unwrap_or_default();
    let delimiter = q.delimiter.clone().unwrap_or_default();

    let xml = if q.versioning.is_some() {
        let settings = state.gateway.get_bucket_versioning(&ctx, &bucket).await?;
        build_versioning_xml(&settings)
    } else if q.versions.is_some() {
        let params = ListObjectVersionsParams {
            bucket: bucket.clone(),
            prefix,
            delimiter,
            max_keys,
            key_marker: q.key_marker.clone().unwrap_or_default(),
            version_id_marker: q.version_id_marker.clone().unwrap_or_default(),
        };
        let result = state.gateway.list_object_versions(&ctx, &params).await?;
        build_list_versions_xml(&params, &result)
    } else if q.list_type == Some(2) {
        let continuation_token_raw = q.continuation_token.clone();
        let params = ListObjectsParamsV2 {
            common: ListObjectsParamsCommon {
                bucket: bucket.clone(),
                prefix,
                delimiter,
                max_keys,
            },
            continuation_token: continuation_token_raw
                .as_deref()
                .map(decode_continuation_token),
            start_after: q.start_after.clone().unwrap_or_default(),
        };
        let result = state.gateway.list_objects_v2(&ctx, &params).await?;
        let mut xml = open_list_bucket_xml(&params.common, &result.info);
        if let Some(token) = continuation_token_raw.as_deref() {
            push_element(&mut xml, "ContinuationToken", token);
        }
        if !params.start_after.is_empty() {
            push_element(&mut xml, "StartAfter", &params.start_after);
        }
        if let Some(next) = &result.next_continuation_token {
            push_element(
                &mut xml,
                "NextContinuationToken",
                &encode_continuation_token(next),
            );
        }
        close_list_bucket_xml(xml, &result.info)
    } else {
        let params = ListObjectsParamsV1 {
            common: ListObjectsParamsCommon {
                bucket: bucket.clone(),
                prefix,
                delimiter,
                max_keys,
            },
            marker: q.marker.clone().unwrap_or_default(),
        };
        let result = state.gateway.list_objects_v1(&ctx, &params).await?;
        let mut xml = open_list_bucket_xml(&params.common, &result.info);
        push_element(&mut xml, "Marker", &params.marker);
        if let Some(next) = &result.next_marker {
            push_element(&mut xml, "NextMarker", next);
        }
        close_list_bucket_xml(xml, &result.info)
    };

    Ok(xml_response(xml))
}

/// PUT `/{bucket}`: create bucket, or set versioning with `?versioning`.
pub async fn put_bucket(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Query(q): Query<BucketQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let ctx = state.context(&headers);

    if q.versioning.is_some() {
        let req: VersioningReq = serde_json::from_slice(&body)
            .map_err(|err| AppError::bad_request("MalformedXML", err.to_string()))?;
        let versioning_enabled = match req.status.as_str() {
            "Enabled" => true,
            "Suspended" => false,
            other => {
                return Err(AppError::bad_request(
                    "IllegalVersioningConfigurationException",
                    format!("unknown versioning status `{}`", other),
                ));
            }
        };
        let settings = state
            .gateway
            .put_bucket_versioning(&ctx, &bucket, BucketSettings { versioning_enabled })
            .await?;
        return Ok(xml_response(build_versioning_xml(&settings)));
    }

    let region = if body.is_empty() {
        None
    } else {
        serde_json::from_slice::<CreateBucketReq>(&body)
            .map_err(|err| AppError::bad_request("MalformedXML", err.to_string()))?
            .location_constraint
    }
    .unwrap_or_else(|| "local".into());

    state.gateway.create_bucket(&ctx, &bucket, &region).await?;

    let xml = format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<CreateBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">"#,
            r#"<Location>/{}</Location>"#,
            r#"</CreateBucketResult>"#
        ),
        xml_escape(&bucket)
    );
    Ok(xml_response(xml))
}

fn reject_delete_marker(info: &ObjectInfo) -> Result<(), AppError> {
    if info.is_delete_marker() {
        return Err(AppError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "MethodNotAllowed",
            "the specified version is a delete marker",
        ));
    }
    Ok(())
}

/// Parse a single `bytes=` range against the payload size.
fn parse_range(value: &str, size: u64) -> Result<ByteRange, AppError> {
    let invalid = || {
        AppError::new(
            StatusCode::RANGE_NOT_SATISFIABLE,
            "InvalidRange",
            format!("range `{}` is not satisfiable", value),
        )
    };

    let ranges = value.trim().strip_prefix("bytes=").ok_or_else(invalid)?;
    let (start, end) = ranges.split_once('-').ok_or_else(invalid)?;
    let range = match (start.trim(), end.trim()) {
        ("", suffix) => {
            let suffix: u64 = suffix.parse().map_err(|_| invalid())?;
            if suffix == 0 || size == 0 {
                return Err(invalid());
            }
            ByteRange {
                start: size.saturating_sub(suffix),
                end: size - 1,
            }
        }
        (start, "") => ByteRange {
            start: start.parse().map_err(|_| invalid())?,
            end: u64::MAX,
        },
        (start, end) => ByteRange {
            start: start.parse().map_err(|_| invalid())?,
            end: end.parse().map_err(|_| invalid())?,
        },
    };
    check_range(range, size).map_err(|_| invalid())
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

fn set_object_headers(headers: &mut HeaderMap, info: &ObjectInfo, range: Option<ByteRange>) {
    let content_type = if info.content_type.is_empty() {
        "application/octet-stream"
    } else {
        info.content_type.as_str()
    };
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    let length = range.map_or(info.size, |r| r.len());
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    if let Some(range) = range {
        insert_header(
            headers,
            "content-range",
            &format!("bytes {}-{}/{}", range.start, range.end, info.size),
        );
    }
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", info.hash_sum)) {
        headers.insert(header::ETAG, value);
    }

    if let Ok(value) = HeaderValue::from_str(&info.created.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
    insert_header(headers, "x-amz-version-id", &info.surfaced_version());

    for (name, value) in info.user_headers() {
        let name = format!("{}{}", USER_META_PREFIX, name.to_ascii_lowercase());
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
}

fn xml_response(xml: String) -> Response {
    let mut response = Response::new(Body::from(xml));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml"),
    );
    *response.status_mut() = StatusCode::OK;
    response
}

fn push_element(xml: &mut String, name: &str, value: &str) {
    xml.push_str(&format!("<{name}>{}</{name}>", xml_escape(value)));
}

fn bool_str(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

fn open_list_bucket_xml(params: &ListObjectsParamsCommon, info: &ListObjectsInfo) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8"?><ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">"#,
    );
    push_element(&mut xml, "Name", &params.bucket);
    push_element(&mut xml, "Prefix", &params.prefix);
    xml.push_str(&format!("<MaxKeys>{}</MaxKeys>", params.max_keys));
    xml.push_str(&format!(
        "<KeyCount>{}</KeyCount>",
        info.objects.len() + info.common_prefixes.len()
    ));
    if !params.delimiter.is_empty() {
        push_element(&mut xml, "Delimiter", &params.delimiter);
    }
    push_element(&mut xml, "IsTruncated", bool_str(info.is_truncated));
    xml
}

fn close_list_bucket_xml(mut xml: String, info: &ListObjectsInfo) -> String {
    for obj in &info.objects {
        xml.push_str("<Contents>");
        push_element(&mut xml, "Key", &obj.name);
        push_element(
            &mut xml,
            "LastModified",
            &obj.created.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        push_element(&mut xml, "ETag", &format!("\"{}\"", obj.hash_sum));
        xml.push_str(&format!("<Size>{}</Size>", obj.size));
        push_element(&mut xml, "StorageClass", "STANDARD");
        push_owner(&mut xml, obj);
        xml.push_str("</Contents>");
    }

    push_common_prefixes(&mut xml, &info.common_prefixes);
    xml.push_str("</ListBucketResult>");
    xml
}

fn push_owner(xml: &mut String, obj: &ObjectInfo) {
    if let Some(owner) = &obj.owner {
        xml.push_str("<Owner>");
        push_element(xml, "ID", owner);
        push_element(xml, "DisplayName", owner);
        xml.push_str("</Owner>");
    }
}

fn push_common_prefixes(xml: &mut String, prefixes: &[String]) {
    for prefix in prefixes {
        xml.push_str("<CommonPrefixes>");
        push_element(xml, "Prefix", prefix);
        xml.push_str("</CommonPrefixes>");
    }
}

fn push_version(xml: &mut String, tag: &str, entry: &ObjectVersionInfo) {
    let obj = &entry.object;
    xml.push_str(&format!("<{}>", tag));
    push_element(xml, "Key", &obj.name);
    push_element(xml, "VersionId", &obj.version());
    push_element(xml, "IsLatest", bool_str(entry.is_latest));
    push_element(
        xml,
        "LastModified",
        &obj.created.to_rfc3339_opts(SecondsFormat::Millis, true),
    );
    if tag == "Version" {
        push_element(xml, "ETag", &format!("\"{}\"", obj.hash_sum));
        xml.push_str(&format!("<Size>{}</Size>", obj.size));
        push_element(xml, "StorageClass", "STANDARD");
    }
    push_owner(xml, obj);
    xml.push_str(&format!("</{}>", tag));
}

fn build_list_versions_xml(
    params: &ListObjectVersionsParams,
    result: &ListObjectVersionsInfo,
) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8"?><ListVersionsResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">"#,
    );
    push_element(&mut xml, "Name", &params.bucket);
    push_element(&mut xml, "Prefix", &params.prefix);
    push_element(&mut xml, "KeyMarker", &params.key_marker);
    push_element(&mut xml, "VersionIdMarker", &params.version_id_marker);
    if let Some(next) = &result.next_key_marker {
        push_element(&mut xml, "NextKeyMarker", next);
    }
    if let Some(next) = &result.next_version_id_marker {
        push_element(&mut xml, "NextVersionIdMarker", next);
    }
    xml.push_str(&format!("<MaxKeys>{}</MaxKeys>", params.max_keys));
    if !params.delimiter.is_empty() {
        push_element(&mut xml, "Delimiter", &params.delimiter);
    }
    push_element(&mut xml, "IsTruncated", bool_str(result.is_truncated));

    for entry in &result.versions {
        push_version(&mut xml, "Version", entry);
    }
    for entry in &result.delete_markers {
        push_version(&mut xml, "DeleteMarker", entry);
    }
    push_common_prefixes(&mut xml, &result.common_prefixes);
    xml.push_str("</ListVersionsResult>");
    xml
}

fn build_versioning_xml(settings: &BucketSettings) -> String {
    let status = if settings.versioning_enabled {
        "Enabled"
    } else {
        "Suspended"
    };
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<VersioningConfiguration xmlns="http://s3.amazonaws.com/doc/2006-03-01/">"#,
            r#"<Status>{}</Status>"#,
            r#"</VersioningConfiguration>"#
        ),
        status
    )
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn encode_continuation_token(token: &str) -> String {
    general_purpose::STANDARD.encode(token)
}

fn decode_continuation_token(token: &str) -> String {
    general_purpose::STANDARD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| token.to_string())
}

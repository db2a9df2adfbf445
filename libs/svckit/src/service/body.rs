//! Request body parsing stages.
//!
//! Each stage handles one content type and leaves other requests untouched.
//! A parsed body is stored as [`ParsedBody`]; a body that cannot be parsed is
//! recorded as [`BodyRejection`] and reported by the context stage, so the
//! failure still goes through the terminal stage.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use serde_json::{json, Map, Value};

/// Parsed request body.
#[derive(Clone, Debug)]
pub struct ParsedBody(pub Value);

/// Why the body could not be parsed.
#[derive(Clone, Debug)]
pub struct BodyRejection {
    pub status: StatusCode,
    pub reason: String,
}

#[derive(Clone, Debug)]
pub struct BodyLimits {
    pub max_bytes: usize,
    /// Where multipart file fields are written.
    pub upload_dir: PathBuf,
}

fn content_type(req: &Request) -> Option<mime::Mime> {
    req.headers()
        .get(CONTENT_TYPE)?
        .to_str()
        .ok()?
        .parse::<mime::Mime>()
        .ok()
}

fn reject(mut req: Request, status: StatusCode, reason: impl Into<String>) -> Request {
    let reason = reason.into();
    tracing::debug!(%status, %reason, "request body rejected");
    req.extensions_mut().insert(BodyRejection { status, reason });
    req
}

async fn read_body(req: Request, limit: usize) -> Result<(Request, axum::body::Bytes), Request> {
    let (parts, body) = req.into_parts();
    match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => Ok((Request::from_parts(parts, Body::empty()), bytes)),
        Err(e) => Err(reject(
            Request::from_parts(parts, Body::empty()),
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("failed to read request body: {e}"),
        )),
    }
}

/// Repeated keys collect into an array.
fn insert_repeated(map: &mut Map<String, Value>, key: String, value: Value) {
    match map.get_mut(&key) {
        None => {
            map.insert(key, value);
        }
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
    }
}

pub async fn json_body(State(limits): State<Arc<BodyLimits>>, req: Request, next: Next) -> Response {
    let is_json = content_type(&req).is_some_and(|m| {
        (m.type_() == mime::APPLICATION && m.subtype() == mime::JSON) || m.suffix() == Some(mime::JSON)
    });
    if !is_json {
        return next.run(req).await;
    }

    let req = match read_body(req, limits.max_bytes).await {
        Ok((mut req, bytes)) => {
            if bytes.iter().all(u8::is_ascii_whitespace) {
                req.extensions_mut().insert(ParsedBody(json!({})));
                req
            } else {
                match serde_json::from_slice::<Value>(&bytes) {
                    Ok(value) => {
                        req.extensions_mut().insert(ParsedBody(value));
                        req
                    }
                    Err(e) => reject(req, StatusCode::BAD_REQUEST, format!("invalid JSON body: {e}")),
                }
            }
        }
        Err(req) => req,
    };
    next.run(req).await
}

/// Flat `application/x-www-form-urlencoded` values; repeated keys become arrays.
pub async fn form_body(State(limits): State<Arc<BodyLimits>>, req: Request, next: Next) -> Response {
    let is_form = content_type(&req).is_some_and(|m| m.essence_str() == "application/x-www-form-urlencoded");
    if !is_form {
        return next.run(req).await;
    }

    let req = match read_body(req, limits.max_bytes).await {
        Ok((mut req, bytes)) => {
            let mut fields = Map::new();
            for (k, v) in form_urlencoded::parse(&bytes) {
                insert_repeated(&mut fields, k.into_owned(), Value::String(v.into_owned()));
            }
            req.extensions_mut().insert(ParsedBody(Value::Object(fields)));
            req
        }
        Err(req) => req,
    };
    next.run(req).await
}

/// Text fields become strings; file fields are written to the upload dir and
/// described as `{originalFilename, path, size, contentType}`.
pub async fn multipart_body(State(limits): State<Arc<BodyLimits>>, req: Request, next: Next) -> Response {
    let is_multipart = content_type(&req)
        .is_some_and(|m| m.type_() == mime::MULTIPART && m.subtype() == mime::FORM_DATA);
    if !is_multipart {
        return next.run(req).await;
    }

    let (parts, body) = req.into_parts();
    let mut inner = Request::new(body);
    *inner.headers_mut() = parts.headers.clone();
    *inner.extensions_mut() = parts.extensions.clone();
    let req = Request::from_parts(parts, Body::empty());

    let req = match Multipart::from_request(inner, &()).await {
        Ok(multipart) => match collect_fields(multipart, &limits).await {
            Ok(fields) => {
                let mut req = req;
                req.extensions_mut().insert(ParsedBody(Value::Object(fields)));
                req
            }
            Err(reason) => reject(req, StatusCode::BAD_REQUEST, reason),
        },
        Err(e) => reject(req, e.status(), e.body_text()),
    };
    next.run(req).await
}

async fn collect_fields(mut multipart: Multipart, limits: &BodyLimits) -> Result<Map<String, Value>, String> {
    let mut fields = Map::new();
    while let Some(field) = multipart.next_field().await.map_err(|e| e.body_text())? {
        let name = field.name().unwrap_or_default().to_string();
        let Some(original) = field.file_name().map(str::to_string) else {
            let text = field.text().await.map_err(|e| e.body_text())?;
            insert_repeated(&mut fields, name, Value::String(text));
            continue;
        };

        let content_type = field.content_type().map(str::to_string);
        let data = field.bytes().await.map_err(|e| e.body_text())?;

        let extension = std::path::Path::new(&original)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        let path = limits
            .upload_dir
            .join(format!("{}{extension}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&limits.upload_dir)
            .await
            .map_err(|e| format!("cannot create upload dir: {e}"))?;
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| format!("cannot store upload: {e}"))?;

        insert_repeated(
            &mut fields,
            name,
            json!({
                "originalFilename": original,
                "path": path.to_string_lossy(),
                "size": data.len(),
                "contentType": content_type,
            }),
        );
    }
    Ok(fields)
}

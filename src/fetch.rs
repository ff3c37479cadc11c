//! The fetch collaborator: runs a query over an authenticated transport.
//!
//! [`HttpFetcher`] is a configuration-driven implementation for targets that
//! answer with JSON. It knows nothing about page markup; what counts as
//! "session expired" or "no record" is decided by configured markers.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;
use url::form_urlencoded;

use crate::error::{Error, Result};
use crate::query::{Query, QueryKind};
use crate::session::Transport;

/// What one fetch produced.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome<T = Value> {
  Found(T),
  NotFound,
  /// The target no longer recognizes the session
  SessionExpired,
}

/// Performs the network part of a resolution.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, query: &Query, transport: &Transport) -> Result<FetchOutcome>;

  /// Whether queries of `kind` can be fetched at all. Checked before a
  /// session is borrowed.
  fn supports(&self, _kind: QueryKind) -> bool {
    true
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  #[default]
  Get,
  Post,
}

/// One request in a fetch sequence.
///
/// `{param}` placeholders in `path` and in form values are replaced with the
/// query's parameter of that name (URL-encoded in the path, empty if absent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
  #[serde(default)]
  pub method: Method,
  pub path: String,
  #[serde(default)]
  pub form: BTreeMap<String, String>,
}

impl Step {
  pub fn get(path: impl Into<String>) -> Self {
    Self {
      method: Method::Get,
      path: path.into(),
      form: BTreeMap::new(),
    }
  }

  pub fn post(path: impl Into<String>, form: BTreeMap<String, String>) -> Self {
    Self {
      method: Method::Post,
      path: path.into(),
      form,
    }
  }
}

/// Response substrings that classify a reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMarkers {
  /// Final URL fragments meaning we were bounced to the login page
  pub expired_url: Vec<String>,
  /// Body fragments meaning the session is gone
  pub expired_body: Vec<String>,
  /// Body fragments meaning the target has no record
  pub not_found: Vec<String>,
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
  needles.iter().any(|n| !n.is_empty() && haystack.contains(n.as_str()))
}

/// Classify a final response.
pub fn classify(
  status: StatusCode,
  final_url: &str,
  body: &str,
  markers: &ResponseMarkers,
) -> Result<FetchOutcome> {
  if contains_any(final_url, &markers.expired_url) || contains_any(body, &markers.expired_body) {
    return Ok(FetchOutcome::SessionExpired);
  }
  if status == StatusCode::NOT_FOUND || contains_any(body, &markers.not_found) {
    return Ok(FetchOutcome::NotFound);
  }
  if !status.is_success() {
    return Err(Error::Network(format!("target returned {}", status)));
  }

  let value: Value = serde_json::from_str(body)
    .map_err(|e| Error::parse(format!("response is not JSON: {}", e), body))?;

  let empty = match &value {
    Value::Null => true,
    Value::Object(map) => map.is_empty(),
    Value::Array(items) => items.is_empty(),
    _ => false,
  };
  Ok(if empty {
    FetchOutcome::NotFound
  } else {
    FetchOutcome::Found(value)
  })
}

/// Replace `{name}` placeholders with the query's wire values.
fn fill(template: &str, query: &Query, encode: bool) -> String {
  let mut out = String::with_capacity(template.len());
  let mut rest = template;

  while let Some(open) = rest.find('{') {
    let Some(len) = rest[open..].find('}') else {
      break;
    };
    out.push_str(&rest[..open]);
    let name = &rest[open + 1..open + len];
    let value = query.wire_param(name).unwrap_or_default();
    if encode {
      out.extend(form_urlencoded::byte_serialize(value.as_bytes()));
    } else {
      out.push_str(value);
    }
    rest = &rest[open + len + 1..];
  }

  out.push_str(rest);
  out
}

/// JSON-over-HTTP fetcher driven by per-kind step lists.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
  endpoints: HashMap<QueryKind, Vec<Step>>,
  markers: ResponseMarkers,
}

impl HttpFetcher {
  pub fn new(endpoints: HashMap<QueryKind, Vec<Step>>, markers: ResponseMarkers) -> Self {
    Self { endpoints, markers }
  }

  async fn send(&self, step: &Step, query: &Query, transport: &Transport) -> Result<(StatusCode, String, String)> {
    let url = transport.url(&fill(&step.path, query, true))?;
    let request = match step.method {
      Method::Get => transport.client().get(url),
      Method::Post => {
        let form: Vec<(&str, String)> = step
          .form
          .iter()
          .map(|(k, v)| (k.as_str(), fill(v, query, false)))
          .collect();
        transport.client().post(url).form(&form)
      }
    };

    let response = request.send().await?;
    let status = response.status();
    let final_url = response.url().to_string();
    let body = response.text().await?;
    debug!(status = %status, url = %final_url, bytes = body.len(), "Fetched");
    Ok((status, final_url, body))
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  fn supports(&self, kind: QueryKind) -> bool {
    self.endpoints.get(&kind).is_some_and(|steps| !steps.is_empty())
  }

  async fn fetch(&self, query: &Query, transport: &Transport) -> Result<FetchOutcome> {
    let steps = self
      .endpoints
      .get(&query.kind())
      .filter(|steps| !steps.is_empty())
      .ok_or_else(|| Error::Unsupported(format!("no endpoint configured for {} queries", query.kind())))?;

    let (last, preparatory) = steps
      .split_last()
      .ok_or_else(|| Error::Unsupported(format!("no endpoint configured for {} queries", query.kind())))?;

    // Earlier steps only need to land on an authenticated page.
    for step in preparatory {
      let (status, final_url, body) = self.send(step, query, transport).await?;
      if contains_any(&final_url, &self.markers.expired_url)
        || contains_any(&body, &self.markers.expired_body)
      {
        return Ok(FetchOutcome::SessionExpired);
      }
      if !status.is_success() {
        return Err(Error::Network(format!("step {} returned {}", step.path, status)));
      }
    }

    let (status, final_url, body) = self.send(last, query, transport).await?;
    classify(status, &final_url, &body, &self.markers)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn markers() -> ResponseMarkers {
    ResponseMarkers {
      expired_url: vec!["view=login".into()],
      expired_body: vec!["Iniciar sesión".into()],
      not_found: vec!["No se encontraron".into()],
    }
  }

  #[test]
  fn expired_markers_win_over_status() {
    let outcome = classify(
      StatusCode::OK,
      "https://records.example/index.php?view=login",
      "{}",
      &markers(),
    )
    .unwrap();
    assert_eq!(outcome, FetchOutcome::SessionExpired);

    let outcome = classify(StatusCode::OK, "https://x/", "<h1>Iniciar sesión</h1>", &markers()).unwrap();
    assert_eq!(outcome, FetchOutcome::SessionExpired);
  }

  #[test]
  fn not_found_by_status_marker_or_empty_json() {
    let m = markers();
    assert_eq!(classify(StatusCode::NOT_FOUND, "https://x/", "", &m).unwrap(), FetchOutcome::NotFound);
    assert_eq!(
      classify(StatusCode::OK, "https://x/", "No se encontraron resultados", &m).unwrap(),
      FetchOutcome::NotFound
    );
    for body in ["null", "{}", "[]"] {
      assert_eq!(classify(StatusCode::OK, "https://x/", body, &m).unwrap(), FetchOutcome::NotFound);
    }
  }

  #[test]
  fn server_errors_are_network_errors() {
    let err = classify(StatusCode::BAD_GATEWAY, "https://x/", "{}", &markers()).unwrap_err();
    assert!(matches!(err, Error::Network(_)));
  }

  #[test]
  fn non_json_body_is_parse_error_with_short_snippet() {
    let body = format!("<html>{}</html>", "a".repeat(500));
    match classify(StatusCode::OK, "https://x/", &body, &markers()).unwrap_err() {
      Error::Parse { snippet, .. } => {
        assert!(snippet.starts_with("<html>"));
        assert_eq!(snippet.chars().count(), crate::error::DIAGNOSTIC_LIMIT);
      }
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn json_record_is_found() {
    let outcome = classify(StatusCode::OK, "https://x/", r#"{"dni":"80660244"}"#, &markers()).unwrap();
    assert_eq!(outcome, FetchOutcome::Found(json!({"dni": "80660244"})));
  }

  #[test]
  fn placeholders_are_filled_and_encoded() {
    let query = Query::name("Ana María", "Pérez", "").unwrap();
    assert_eq!(
      fill("search?n={given}&p={paternal}&m={maternal}", &query, true),
      "search?n=Ana+Mar%C3%ADa&p=P%C3%A9rez&m="
    );
    assert_eq!(fill("{given} {paternal}", &query, false), "Ana María Pérez");
    assert_eq!(fill("no placeholders {", &query, false), "no placeholders {");
  }

  #[test]
  fn steps_deserialize_with_defaults() {
    let steps: Vec<Step> = serde_yaml::from_str(
      r#"
      - method: POST
        path: index.php?action=validate
        form: { dni: "{id}" }
      - path: index.php?view=result&dni={id}
      "#,
    )
    .unwrap();
    assert_eq!(steps[0].method, Method::Post);
    assert_eq!(steps[1], Step::get("index.php?view=result&dni={id}"));
  }
}

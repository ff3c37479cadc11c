#![allow(dead_code)]

use gatecache::app::{App, Startup};
use gatecache::config::Config;
use serde_json::{json, Value};
use std::path::Path;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const LOGIN_PAGE: &str = r#"
<html><body>
  <form action="/login" method="post">
    <input type="hidden" name="token" value="xyz">
    <input type="text" name="usuario">
    <input type="password" name="clave">
    <input type="submit" value="Ingresar">
  </form>
</body></html>
"#;

pub fn record() -> Value {
  json!({
    "dni": "80660244",
    "nombres": "ANA MARIA",
    "telefonos": ["987 654 321"]
  })
}

/// Target with a working login flow: form page, form post setting a session
/// cookie, and a home page that only shows the marker with that cookie.
pub async fn target() -> MockServer {
  let server = MockServer::start().await;

  Mock::given(method("GET"))
    .and(path("/login"))
    .respond_with(ResponseTemplate::new(200).set_body_string(LOGIN_PAGE))
    .mount(&server)
    .await;

  Mock::given(method("POST"))
    .and(path("/login"))
    .and(body_string_contains("token=xyz"))
    .and(body_string_contains("usuario=agent"))
    .and(body_string_contains("clave=secret"))
    .respond_with(
      ResponseTemplate::new(200)
        .insert_header("set-cookie", "PHPSESSID=abc; Path=/")
        .set_body_string("ok"),
    )
    .mount(&server)
    .await;

  Mock::given(method("GET"))
    .and(path("/home"))
    .and(header("cookie", "PHPSESSID=abc"))
    .respond_with(ResponseTemplate::new(200).set_body_string("<a>Cerrar sesión</a>"))
    .mount(&server)
    .await;

  server
}

pub fn config(server: &MockServer, db: &Path, password: &str) -> Config {
  let yaml = format!(
    r#"
target:
  base_url: {uri}/
  login_path: login
  probe_path: home
  success_markers: ["Cerrar sesión"]
credentials:
  - username: agent
    password: {password}
pool:
  size: 2
  acquire_timeout_secs: 5
http:
  request_timeout_secs: 5
cache:
  path: {db}
fetch:
  endpoints:
    identifier:
      - path: api/persona/{{id}}
  expired_body_markers: ["Iniciar sesión"]
  not_found_markers: ["sin resultados"]
  phone_paths: ["/telefonos"]
"#,
    uri = server.uri(),
    password = password,
    db = db.display(),
  );
  Config::from_yaml(&yaml).unwrap()
}

pub async fn app(server: &MockServer, db: &Path) -> App {
  App::new(config(server, db, "secret"), Startup::Lazy)
    .await
    .unwrap()
}

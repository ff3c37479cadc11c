//! Login flows.
//!
//! The form flow treats the login page opaquely: whatever hidden inputs and
//! action the first credential form declares are echoed back, with only the
//! username and password fields filled in.

use async_trait::async_trait;
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use super::transport::{Credentials, Transport};
use crate::error::{Error, Result};

/// Performs a login on a transport.
#[async_trait]
pub trait Authenticator: Send + Sync {
  /// Authenticate the transport's cookie jar. Must leave the jar logged in on
  /// success and return [`Error::Authentication`] when the target refuses.
  async fn authenticate(&self, transport: &Transport, credentials: &Credentials) -> Result<()>;
}

/// A login form pulled out of an HTML page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginForm {
  pub action: Url,
  pub method: String,
  /// Declared inputs in document order, with their default values
  pub fields: Vec<(String, String)>,
}

impl LoginForm {
  fn has_field(&self, name: &str) -> bool {
    self.fields.iter().any(|(n, _)| n == name)
  }

  fn set(&mut self, name: &str, value: &str) {
    match self.fields.iter_mut().find(|(n, _)| n == name) {
      Some((_, v)) => *v = value.to_string(),
      None => self.fields.push((name.to_string(), value.to_string())),
    }
  }

  /// First declared field whose name contains any of `hints`.
  fn find_field(&self, hints: &[&str]) -> Option<String> {
    self
      .fields
      .iter()
      .map(|(name, _)| name)
      .find(|name| {
        let lower = name.to_lowercase();
        hints.iter().any(|hint| lower.contains(hint))
      })
      .cloned()
  }
}

/// Extract the login form from `html`.
///
/// Prefers the first form containing a password input, otherwise the first
/// form on the page. The action is resolved against `page_url`.
pub fn extract_login_form(html: &str, page_url: &Url) -> Option<LoginForm> {
  let document = Html::parse_document(html);
  let form_sel = Selector::parse("form").ok()?;
  let input_sel = Selector::parse("input[name], select[name], textarea[name]").ok()?;
  let password_sel = Selector::parse(r#"input[type="password"]"#).ok()?;

  let form = document
    .select(&form_sel)
    .find(|form| form.select(&password_sel).next().is_some())
    .or_else(|| document.select(&form_sel).next())?;

  let action = match form.value().attr("action").map(str::trim) {
    Some(action) if !action.is_empty() => page_url.join(action).ok()?,
    _ => page_url.clone(),
  };
  let method = form
    .value()
    .attr("method")
    .unwrap_or("post")
    .to_ascii_uppercase();

  let fields = form
    .select(&input_sel)
    .filter(|input| {
      !matches!(
        input.value().attr("type").map(str::to_ascii_lowercase).as_deref(),
        Some("submit" | "button" | "image" | "reset")
      ) || input.value().attr("value").is_some()
    })
    .filter_map(|input| {
      let name = input.value().attr("name")?.to_string();
      let value = input.value().attr("value").unwrap_or_default().to_string();
      Some((name, value))
    })
    .collect();

  Some(LoginForm {
    action,
    method,
    fields,
  })
}

/// Form-based login followed by a probe of a gated page.
#[derive(Debug, Clone)]
pub struct FormLogin {
  /// Page holding the login form
  pub login_path: String,
  /// Page only reachable when authenticated
  pub probe_path: String,
  /// Strings expected in the probe response only when logged in
  pub success_markers: Vec<String>,
  pub username_field: Option<String>,
  pub password_field: Option<String>,
}

impl FormLogin {
  pub fn new(login_path: impl Into<String>, probe_path: impl Into<String>) -> Self {
    Self {
      login_path: login_path.into(),
      probe_path: probe_path.into(),
      success_markers: Vec::new(),
      username_field: None,
      password_field: None,
    }
  }

  /// Blank markers are dropped; they would match any page.
  pub fn with_success_markers(mut self, markers: Vec<String>) -> Self {
    self.success_markers = markers.into_iter().filter(|m| !m.trim().is_empty()).collect();
    self
  }

  pub fn with_fields(mut self, username: Option<String>, password: Option<String>) -> Self {
    self.username_field = username;
    self.password_field = password;
    self
  }

  fn credential_fields(&self, form: &LoginForm) -> (String, String) {
    let user = self
      .username_field
      .clone()
      .or_else(|| form.find_field(&["user", "usuario", "login", "email"]))
      .unwrap_or_else(|| "username".to_string());
    let pass = self
      .password_field
      .clone()
      .or_else(|| form.find_field(&["pass", "clave"]))
      .unwrap_or_else(|| "password".to_string());
    (user, pass)
  }

  /// Whether a probe body proves the session is logged in. Never true
  /// without a marker.
  pub fn probe_succeeded(&self, body: &str) -> bool {
    self
      .success_markers
      .iter()
      .any(|m| !m.is_empty() && body.contains(m.as_str()))
  }
}

#[async_trait]
impl Authenticator for FormLogin {
  async fn authenticate(&self, transport: &Transport, credentials: &Credentials) -> Result<()> {
    if self.success_markers.is_empty() {
      return Err(Error::Authentication(
        "no success markers configured".to_string(),
      ));
    }
    let login_url = transport.url(&self.login_path)?;

    let page = transport.client().get(login_url.clone()).send().await?;
    if !page.status().is_success() {
      return Err(Error::Authentication(format!(
        "login page returned {}",
        page.status()
      )));
    }
    let page_url = page.url().clone();
    let html = page.text().await?;

    let mut form = extract_login_form(&html, &page_url)
      .ok_or_else(|| Error::Authentication("no login form on login page".to_string()))?;

    let (user_field, pass_field) = self.credential_fields(&form);
    if !form.has_field(&user_field) || !form.has_field(&pass_field) {
      debug!(user_field = %user_field, pass_field = %pass_field, "Credential fields not declared by form, adding them");
    }
    form.set(&user_field, &credentials.username);
    form.set(&pass_field, &credentials.password);

    let request = if form.method == "GET" {
      transport.client().get(form.action.clone()).query(&form.fields)
    } else {
      transport.client().post(form.action.clone()).form(&form.fields)
    };
    let submitted = request
      .header(reqwest::header::REFERER, login_url.as_str())
      .send()
      .await?;
    if !submitted.status().is_success() {
      return Err(Error::Authentication(format!(
        "login submission returned {}",
        submitted.status()
      )));
    }

    let probe = transport
      .client()
      .get(transport.url(&self.probe_path)?)
      .send()
      .await?;
    if !probe.status().is_success() {
      return Err(Error::Authentication(format!(
        "probe returned {}",
        probe.status()
      )));
    }
    let body = probe.text().await?;
    if !self.probe_succeeded(&body) {
      return Err(Error::Authentication(
        "success markers absent from probe response".to_string(),
      ));
    }

    debug!(username = %credentials.username, "Login succeeded");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const PAGE: &str = r#"
    <html><body>
      <form action="/search" method="get"><input name="q"></form>
      <form action="index.php?action=auth" method="post">
        <input type="hidden" name="csrf_token" value="t0k3n">
        <input type="text" name="usuario">
        <input type="password" name="clave_acceso">
        <input type="submit" value="Entrar">
      </form>
    </body></html>
  "#;

  fn page_url() -> Url {
    Url::parse("https://records.example/index.php?view=login").unwrap()
  }

  #[test]
  fn extracts_password_form_with_hidden_fields() {
    let form = extract_login_form(PAGE, &page_url()).unwrap();
    assert_eq!(
      form.action.as_str(),
      "https://records.example/index.php?action=auth"
    );
    assert_eq!(form.method, "POST");
    assert!(form
      .fields
      .contains(&("csrf_token".to_string(), "t0k3n".to_string())));
    assert!(form.has_field("usuario"));
    assert!(form.has_field("clave_acceso"));
  }

  #[test]
  fn missing_action_posts_back_to_page() {
    let html = r#"<form><input name="user"><input type="password" name="pass"></form>"#;
    let form = extract_login_form(html, &page_url()).unwrap();
    assert_eq!(form.action, page_url());
  }

  #[test]
  fn no_form_yields_none() {
    assert!(extract_login_form("<p>maintenance</p>", &page_url()).is_none());
  }

  #[test]
  fn credential_fields_are_detected_or_configured() {
    let form = extract_login_form(PAGE, &page_url()).unwrap();

    let detected = FormLogin::new("login", "home").credential_fields(&form);
    assert_eq!(detected, ("usuario".to_string(), "clave_acceso".to_string()));

    let configured = FormLogin::new("login", "home")
      .with_fields(Some("usuario".into()), Some("pwd".into()))
      .credential_fields(&form);
    assert_eq!(configured, ("usuario".to_string(), "pwd".to_string()));
  }

  #[test]
  fn probe_checks_any_marker() {
    let login = FormLogin::new("login", "home")
      .with_success_markers(vec!["Cerrar sesión".into(), "Generar Consulta".into()]);
    assert!(login.probe_succeeded("<a>Generar Consulta</a>"));
    assert!(!login.probe_succeeded("<form>login</form>"));
  }

  #[test]
  fn login_check_never_passes_without_markers() {
    assert!(!FormLogin::new("login", "home").probe_succeeded(""));
    assert!(!FormLogin::new("login", "home").probe_succeeded("<p>Bienvenido</p>"));

    let blank = FormLogin::new("login", "home").with_success_markers(vec!["".into(), " ".into()]);
    assert!(blank.success_markers.is_empty());
    assert!(!blank.probe_succeeded("anything"));
  }
}

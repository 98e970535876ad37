//! `Cookie.*` commands over the browser's cookie store.


use std::sync::Arc;

use async_trait::async_trait;
use pw_bridge::auxiliary::{opt_str, require_str};
use pw_bridge::{AuxiliaryError, AuxiliaryHandler, now_ms};
use pw_bridge_protocol::{CdpCookie, CdpCookieParam, CookieDetails, ExtensionCookie};
use reqwest::Url;
use serde_json::{Value, json};
use tracing::debug;

use crate::cdp::BrowserCommands;

/// Which cookies a read selects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieFilter {
	/// Cookie domain equal to or below this one.
	pub domain: Option<String>,
	/// Cookies the browser would send to this url.
	pub url: Option<String>,
	pub name: Option<String>,
}

impl CookieFilter {
	fn from_params(params: Option<&Value>, with_name: bool) -> Self {
		Self {
			domain: opt_str(params, "domain").map(str::to_string),
			url: opt_str(params, "url").map(str::to_string),
			name: with_name.then(|| opt_str(params, "name").map(str::to_string)).flatten(),
		}
	}

	pub fn matches(&self, cookie: &CdpCookie) -> bool {
		if self.name.as_ref().is_some_and(|name| *name != cookie.name) {
			return false;
		}
		if let Some(domain) = &self.domain {
			let filter = domain.trim_start_matches('.');
			let own = cookie.domain.trim_start_matches('.');
			if own != filter && !own.ends_with(&format!(".{filter}")) {
				return false;
			}
		}
		match self.url.as_deref() {
			Some(url) => sent_to(cookie, url),
			None => true,
		}
	}
}

/// Whether `cookie` accompanies a request to `url`.
fn sent_to(cookie: &CdpCookie, url: &str) -> bool {
	let Ok(url) = Url::parse(url) else {
		return false;
	};
	let Some(host) = url.host_str() else {
		return false;
	};
	if cookie.secure && url.scheme() != "https" {
		return false;
	}
	let path = url.path();
	let cookie_path = cookie.path.trim_end_matches('/');
	cookie.matches_host(host)
		&& (path == cookie.path || path.starts_with(&format!("{cookie_path}/")) || cookie_path.is_empty())
}

/// Serves `Cookie.getAll`, `set`, `remove`, `export` and `import`.
pub struct CookieJar {
	browser: Arc<dyn BrowserCommands>,
}

impl CookieJar {
	pub fn new(browser: Arc<dyn BrowserCommands>) -> Self {
		Self { browser }
	}

	async fn all(&self) -> Result<Vec<CdpCookie>, AuxiliaryError> {
		let reply = self
			.browser
			.browser_call("Storage.getCookies", json!({}))
			.await
			.map_err(|e| AuxiliaryError::Failed(e.to_string()))?;
		let cookies = reply.get("cookies").cloned().unwrap_or_else(|| json!([]));
		serde_json::from_value(cookies).map_err(|e| AuxiliaryError::Failed(e.to_string()))
	}

	async fn select(&self, filter: &CookieFilter) -> Result<Vec<ExtensionCookie>, AuxiliaryError> {
		Ok(self
			.all()
			.await?
			.iter()
			.filter(|cookie| filter.matches(cookie))
			.map(ExtensionCookie::from)
			.collect())
	}

	async fn store(&self, param: &CdpCookieParam) -> Result<(), AuxiliaryError> {
		self.browser
			.browser_call("Storage.setCookies", json!({ "cookies": [param] }))
			.await
			.map(|_| ())
			.map_err(|e| AuxiliaryError::Failed(e.to_string()))
	}

	/// Writes one cookie and reads it back; `None` if the browser refused it.
	async fn set(&self, details: &CookieDetails) -> Result<Option<ExtensionCookie>, AuxiliaryError> {
		let Some(param) = details.to_cdp_param() else {
			return Err(AuxiliaryError::Failed("Missing url".to_string()));
		};
		self.store(&param).await?;
		let filter = CookieFilter {
			domain: None,
			url: param.url.clone(),
			name: Some(param.name.clone()),
		};
		Ok(self.select(&filter).await?.into_iter().next())
	}

	async fn remove(&self, url: &str, name: &str) -> Result<Value, AuxiliaryError> {
		let filter = CookieFilter {
			domain: None,
			url: Some(url.to_string()),
			name: Some(name.to_string()),
		};
		let matching: Vec<CdpCookie> = self.all().await?.into_iter().filter(|c| filter.matches(c)).collect();
		if matching.is_empty() {
			return Ok(Value::Null);
		}
		for cookie in matching {
			let expired = CdpCookieParam {
				name: cookie.name,
				value: String::new(),
				url: None,
				domain: Some(cookie.domain),
				path: Some(cookie.path),
				secure: Some(cookie.secure),
				http_only: None,
				same_site: None,
				expires: Some(0.0),
			};
			self.store(&expired).await?;
		}
		Ok(json!({ "url": url, "name": name, "storeId": "0" }))
	}

	async fn import(&self, entries: &[Value]) -> Value {
		let mut results = Vec::with_capacity(entries.len());
		for entry in entries {
			let name = entry.get("name").and_then(Value::as_str).unwrap_or_default();
			let outcome = match serde_json::from_value::<CookieDetails>(entry.clone()) {
				Ok(details) if details.url.is_some() => self.set(&details).await.map(|_| ()),
				Ok(_) => Err(AuxiliaryError::Failed("Missing url".to_string())),
				Err(err) => Err(AuxiliaryError::Failed(err.to_string())),
			};
			results.push(match outcome {
				Ok(()) => json!({ "success": true, "name": name }),
				Err(err) => {
					debug!(target = "pw.bridge.cookies", name, error = %err, "cookie import entry failed");
					json!({ "success": false, "name": name, "error": err.to_string() })
				}
			});
		}
		json!({ "results": results })
	}
}

#[async_trait]
impl AuxiliaryHandler for CookieJar {
	fn prefix(&self) -> &'static str {
		"Cookie."
	}

	async fn handle(&self, method: &str, params: Option<Value>) -> Result<Value, AuxiliaryError> {
		let params = params.as_ref();
		match method {
			"Cookie.getAll" => {
				let cookies = self.select(&CookieFilter::from_params(params, true)).await?;
				Ok(json!(cookies))
			}
			"Cookie.set" => {
				require_str(method, params, "url")?;
				let details: CookieDetails = params
					.cloned()
					.map(serde_json::from_value)
					.transpose()
					.map_err(|e| AuxiliaryError::Failed(e.to_string()))?
					.unwrap_or_default();
				Ok(json!(self.set(&details).await?))
			}
			"Cookie.remove" => {
				let url = require_str(method, params, "url")?;
				let name = require_str(method, params, "name")?;
				self.remove(url, name).await
			}
			"Cookie.export" => {
				let cookies = self.select(&CookieFilter::from_params(params, false)).await?;
				Ok(json!({ "cookies": cookies, "exportedAt": now_ms() }))
			}
			"Cookie.import" => {
				let entries = params
					.and_then(|p| p.get("cookies"))
					.and_then(Value::as_array)
					.ok_or_else(|| AuxiliaryError::MissingParam {
						method: method.to_string(),
						param: "cookies array",
					})?;
				Ok(self.import(entries).await)
			}
			other => Err(AuxiliaryError::UnknownCommand {
				family: "cookie",
				method: other.to_string(),
			}),
		}
	}
}

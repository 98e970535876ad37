//! Cookie shapes used by the `Cookie.*` relay commands.
//!
//! The peer speaks the `chrome.cookies` vocabulary ([`ExtensionCookie`],
//! [`CookieDetails`]); browsers reached over the target protocol store
//! [`CdpCookie`]s. Conversions go both ways.

use serde::{Deserialize, Serialize};

/// Cookie as reported by the target protocol (`Storage.getCookies`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdpCookie {
	pub name: String,
	pub value: String,
	pub domain: String,
	#[serde(default = "default_path")]
	pub path: String,
	/// Unix seconds, `-1` (or absent) for session cookies.
	#[serde(default = "session_expiry")]
	pub expires: f64,
	#[serde(default)]
	pub http_only: bool,
	#[serde(default)]
	pub secure: bool,
	#[serde(default)]
	pub session: bool,
	/// `"Strict"`, `"Lax"` or `"None"`.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub same_site: Option<String>,
}

fn default_path() -> String {
	"/".to_string()
}

fn session_expiry() -> f64 {
	-1.0
}

impl CdpCookie {
	pub fn is_session(&self) -> bool {
		self.session || self.expires < 0.0
	}

	/// Whether this cookie would be sent to `host`.
	pub fn matches_host(&self, host: &str) -> bool {
		let host = host.trim_start_matches('.');
		let domain = self.domain.trim_start_matches('.');
		host == domain || host.ends_with(&format!(".{domain}"))
	}
}

/// Cookie in the `chrome.cookies` format returned to the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionCookie {
	pub name: String,
	pub value: String,
	/// Leading dot for domain cookies.
	pub domain: String,
	pub path: String,
	/// Unix seconds, [`None`] for session cookies.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub expiration_date: Option<f64>,
	pub http_only: bool,
	pub secure: bool,
	/// `"lax"`, `"strict"`, `"no_restriction"` or `"unspecified"`.
	pub same_site: String,
	pub host_only: bool,
	pub session: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub store_id: Option<String>,
}

impl From<&CdpCookie> for ExtensionCookie {
	fn from(cookie: &CdpCookie) -> Self {
		let session = cookie.is_session();
		Self {
			name: cookie.name.clone(),
			value: cookie.value.clone(),
			domain: cookie.domain.clone(),
			path: cookie.path.clone(),
			expiration_date: (!session).then_some(cookie.expires),
			http_only: cookie.http_only,
			secure: cookie.secure,
			same_site: match cookie.same_site.as_deref() {
				Some("Strict") => "strict",
				Some("Lax") => "lax",
				Some("None") => "no_restriction",
				_ => "unspecified",
			}
			.to_string(),
			host_only: !cookie.domain.starts_with('.'),
			session,
			store_id: Some("0".to_string()),
		}
	}
}

/// Parameters of `Cookie.set` and the entries of `Cookie.import`.
///
/// Mirrors the `chrome.cookies.set` details object: `url` is required, the
/// rest is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieDetails {
	#[serde(default)]
	pub url: Option<String>,
	#[serde(default)]
	pub name: Option<String>,
	#[serde(default)]
	pub value: Option<String>,
	#[serde(default)]
	pub domain: Option<String>,
	#[serde(default)]
	pub path: Option<String>,
	#[serde(default)]
	pub secure: Option<bool>,
	#[serde(default)]
	pub http_only: Option<bool>,
	#[serde(default)]
	pub same_site: Option<String>,
	#[serde(default)]
	pub expiration_date: Option<f64>,
}

/// Cookie parameter accepted by `Storage.setCookies`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdpCookieParam {
	pub name: String,
	pub value: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub url: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub domain: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub path: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub secure: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub http_only: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub same_site: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub expires: Option<f64>,
}

impl CookieDetails {
	/// Converts to a `Storage.setCookies` parameter; `None` without a url.
	pub fn to_cdp_param(&self) -> Option<CdpCookieParam> {
		let url = self.url.clone()?;
		Some(CdpCookieParam {
			name: self.name.clone().unwrap_or_default(),
			value: self.value.clone().unwrap_or_default(),
			url: Some(url),
			domain: self.domain.clone(),
			path: self.path.clone(),
			secure: self.secure,
			http_only: self.http_only,
			same_site: self.same_site.as_deref().and_then(|s| match s {
				"strict" => Some("Strict".to_string()),
				"lax" => Some("Lax".to_string()),
				"no_restriction" => Some("None".to_string()),
				_ => None,
			}),
			expires: self.expiration_date,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cdp(domain: &str, expires: f64) -> CdpCookie {
		CdpCookie {
			name: "sid".into(),
			value: "abc".into(),
			domain: domain.into(),
			path: "/".into(),
			expires,
			http_only: true,
			secure: true,
			session: false,
			same_site: Some("None".into()),
		}
	}

	#[test]
	fn cdp_cookie_converts_to_extension_format() {
		let ext = ExtensionCookie::from(&cdp(".github.com", 1_700_000_000.0));
		assert_eq!(ext.expiration_date, Some(1_700_000_000.0));
		assert_eq!(ext.same_site, "no_restriction");
		assert!(!ext.host_only);
		assert!(!ext.session);
	}

	#[test]
	fn session_cookie_has_no_expiration() {
		let ext = ExtensionCookie::from(&cdp("github.com", -1.0));
		assert_eq!(ext.expiration_date, None);
		assert!(ext.session);
		assert!(ext.host_only);
	}

	#[test]
	fn host_matching_respects_subdomains() {
		let cookie = cdp(".github.com", -1.0);
		assert!(cookie.matches_host("github.com"));
		assert!(cookie.matches_host("api.github.com"));
		assert!(!cookie.matches_host("notgithub.com"));
	}

	#[test]
	fn details_require_url() {
		assert!(CookieDetails::default().to_cdp_param().is_none());
		let details: CookieDetails = serde_json::from_value(serde_json::json!({
			"url": "https://example.com",
			"name": "a",
			"value": "b",
			"sameSite": "strict",
			"httpOnly": true
		}))
		.unwrap();
		let param = details.to_cdp_param().unwrap();
		assert_eq!(param.same_site.as_deref(), Some("Strict"));
		assert_eq!(param.http_only, Some(true));
		let json = serde_json::to_value(&param).unwrap();
		assert!(json.get("domain").is_none());
	}
}

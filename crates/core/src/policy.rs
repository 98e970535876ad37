//! Which targets may be attached.

/// URL prefixes that are never attached.
const SKIPPED_SCHEMES: [&str; 4] = ["chrome://", "chrome-extension://", "about:", "devtools://"];

/// Excluded-URL policy applied before every attach.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionPolicy {
	/// Admin page of the relay itself, which must stay detached.
	admin_url: Option<String>,
}

impl ExclusionPolicy {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_admin_url(mut self, url: impl Into<String>) -> Self {
		let url = url.into();
		self.admin_url = Some(url).filter(|u| !u.is_empty());
		self
	}

	/// Whether a target showing `url` must not be attached.
	pub fn is_excluded(&self, url: &str) -> bool {
		if url.is_empty() {
			return true;
		}
		if SKIPPED_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
			return true;
		}
		self.admin_url
			.as_deref()
			.is_some_and(|admin| url.starts_with(admin))
	}
}

//! Relay token derivation.
//!
//! The shared secret never leaves the host: the control connection presents
//! `HMAC-SHA256(secret, "pw-bridge-relay-v1:<port>")` instead, hex encoded.

use ring::hmac;

/// Namespace prefix mixed into every derived token.
pub const TOKEN_NAMESPACE: &str = "pw-bridge-relay-v1:";

/// Derives the relay token for `port` from the shared `secret`.
///
/// Deterministic, 64 lowercase hex characters.
pub fn derive_token(secret: &str, port: u16) -> String {
	let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
	let message = format!("{TOKEN_NAMESPACE}{port}");
	let tag = hmac::sign(&key, message.as_bytes());
	hex::encode(tag.as_ref())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn known_vectors() {
		assert_eq!(
			derive_token("secret", 18792),
			"061deb96ea8152ee0c151d6500e1bf58b98a076864fb37c4a6aa27b098088ba9"
		);
		assert_eq!(
			derive_token("gateway-token", 9000),
			"ae212a655302d56029ae156196f4cff27c6c46d11b54d9f37b8c94781edcd087"
		);
	}

	#[test]
	fn port_changes_token() {
		assert_eq!(
			derive_token("secret", 18793),
			"6d90de2a7669d36db48626a39f7251fdc64fd2d418acb6c1ac9cc6cd1f604652"
		);
		assert_ne!(derive_token("secret", 18792), derive_token("secret", 18793));
	}

	#[test]
	fn token_is_lowercase_hex() {
		let token = derive_token("", 0);
		assert_eq!(token.len(), 64);
		assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
		assert_eq!(token, derive_token("", 0));
	}
}

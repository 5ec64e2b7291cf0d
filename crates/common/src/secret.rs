//! Secret handling for credentials the service holds at runtime.
//!
//! The only long-lived secret today is the database connection string, which
//! carries the Postgres password. It is held as a [`SecretString`] from the
//! moment it is read out of the environment so that `Debug` output and
//! tracing fields never contain it.
//!
//! ```rust
//! use common::secret::{redacted_url, SecretString};
//!
//! let url = SecretString::from("postgres://chat:hunter2@db:5432/chat");
//! assert_eq!(redacted_url(&url), "postgres://chat:***@db:5432/chat");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

/// Render a connection URL with its password replaced by `***`.
///
/// URLs without userinfo are returned unchanged. Anything that does not look
/// like `scheme://...` is fully masked, since we cannot tell where the
/// credentials are.
#[must_use]
pub fn redacted_url(url: &SecretString) -> String {
    let raw = url.expose_secret();
    let Some((scheme, rest)) = raw.split_once("://") else {
        return "***".to_string();
    };
    let Some((userinfo, host)) = rest.rsplit_once('@') else {
        return raw.to_string();
    };
    match userinfo.split_once(':') {
        Some((user, _password)) => format!("{scheme}://{user}:***@{host}"),
        None => format!("{scheme}://{userinfo}@{host}"),
    }
}

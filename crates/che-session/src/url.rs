//! Connection URL construction.
//!
//! `entrypoint[?clientId=<id>][&token=<token>]`. The client id is added once
//! the server has assigned one; the token is fetched from a
//! [`TokenProvider`] on every connect so refreshed credentials are used.

use async_trait::async_trait;
use che_core::constants::{CLIENT_ID_PARAM, TOKEN_PARAM};
use che_core::ids::ClientId;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

/// Characters escaped in query values: everything but unreserved ones.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Source of the bearer token appended to connection URLs.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current token, or `None` to connect without one.
    async fn token(&self) -> Option<String>;
}

/// A token that never changes.
#[derive(Clone, Debug)]
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Build the URL used to (re)connect to `entrypoint`.
///
/// When the entrypoint already carries a query string the client id is
/// inserted right after the `?`, ahead of the existing parameters.
pub fn connection_url(entrypoint: &str, client_id: Option<&ClientId>, token: Option<&str>) -> String {
    let mut url = match client_id {
        None => entrypoint.to_owned(),
        Some(id) => {
            let pair = format!("{CLIENT_ID_PARAM}={}", encode(id));
            match entrypoint.split_once('?') {
                Some((base, "")) => format!("{base}?{pair}"),
                Some((base, query)) => format!("{base}?{pair}&{query}"),
                None => format!("{entrypoint}?{pair}"),
            }
        }
    };

    if let Some(token) = token.filter(|t| !t.is_empty()) {
        let sep = match url.find('?') {
            Some(pos) if pos + 1 == url.len() => "",
            Some(_) => "&",
            None => "?",
        };
        url.push_str(sep);
        url.push_str(TOKEN_PARAM);
        url.push('=');
        url.push_str(&encode(token));
    }
    url
}

fn encode(value: &str) -> String {
    utf8_percent_encode(value, QUERY_VALUE).to_string()
}

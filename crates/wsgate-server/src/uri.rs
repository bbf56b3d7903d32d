//! Connection URI parsing: `/{tenant}/{handler}?k={token}&...`.

use std::collections::BTreeMap;

use percent_encoding::percent_decode_str;

use crate::errors::RouteError;

/// Name of the query parameter carrying the token.
pub const TOKEN_PARAM: &str = "k";

/// Multi-valued query parameters; repeated values keep their order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryParams(BTreeMap<String, Vec<String>>);

impl QueryParams {
    /// Parse an `application/x-www-form-urlencoded` query string.
    pub fn parse(query: &str) -> Self {
        let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            params
                .entry(decode_component(name, true))
                .or_default()
                .push(decode_component(value, true));
        }
        Self(params)
    }

    /// All values of `name`.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.0.get(name).map_or(&[], Vec::as_slice)
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(String::as_str)
    }

    /// Value of `name` when it appears exactly once.
    pub fn single(&self, name: &str) -> Option<&str> {
        match self.get_all(name) {
            [only] => Some(only),
            _ => None,
        }
    }

    /// Iterate parameter names with their values.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Whether no parameters were given.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A parsed connection URI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionUri {
    /// Tenant segment.
    pub tenant: String,
    /// Handler segment.
    pub handler: String,
    /// All query parameters, including the token.
    pub params: QueryParams,
}

impl ConnectionUri {
    /// Parse a request path and optional query string.
    ///
    /// The path must have exactly two non-empty segments after decoding.
    pub fn parse(path: &str, query: Option<&str>) -> Result<Self, RouteError> {
        let bad = || RouteError::Parse(path.to_owned());
        let rest = path.strip_prefix('/').ok_or_else(bad)?;
        let mut segments = rest.split('/');
        let (Some(tenant), Some(handler), None) =
            (segments.next(), segments.next(), segments.next())
        else {
            return Err(bad());
        };
        let tenant = decode_component(tenant, false);
        let handler = decode_component(handler, false);
        if tenant.is_empty() || handler.is_empty() {
            return Err(bad());
        }
        Ok(Self {
            tenant,
            handler,
            params: query.map(QueryParams::parse).unwrap_or_default(),
        })
    }

    /// The token, when `k` is present exactly once.
    pub fn token(&self) -> Option<&str> {
        self.params.single(TOKEN_PARAM)
    }

    /// `/{tenant}/{handler}`, used in 404 bodies and logs.
    pub fn path(&self) -> String {
        format!("/{}/{}", self.tenant, self.handler)
    }
}

fn decode_component(raw: &str, plus_as_space: bool) -> String {
    if plus_as_space && raw.contains('+') {
        let spaced = raw.replace('+', " ");
        return percent_decode_str(&spaced).decode_utf8_lossy().into_owned();
    }
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

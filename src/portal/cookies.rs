//! Serialized cookie jar for one tenant.
//!
//! The jar is stored as a plain `Cookie` header value (`a=1; b=2`). Incoming
//! `Set-Cookie` headers update it in memory; the caller persists the whole
//! serialized value afterwards.

use chrono::{NaiveDateTime, Utc};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar {
    cookies: Vec<(String, String)>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `Cookie` header value. Malformed pairs are dropped.
    pub fn parse(header: &str) -> Self {
        let mut jar = Self::new();
        for pair in header.split(';') {
            if let Some((name, value)) = split_pair(pair) {
                jar.set(name, value);
            }
        }
        jar
    }

    /// The jar as a `Cookie` header value.
    pub fn header_value(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    fn set(&mut self, name: &str, value: &str) -> bool {
        match self.cookies.iter_mut().find(|(n, _)| n == name) {
            Some(existing) if existing.1 == value => false,
            Some(existing) => {
                existing.1 = value.to_string();
                true
            }
            None => {
                self.cookies.push((name.to_string(), value.to_string()));
                true
            }
        }
    }

    fn remove(&mut self, name: &str) -> bool {
        let before = self.cookies.len();
        self.cookies.retain(|(n, _)| n != name);
        before != self.cookies.len()
    }

    /// Apply one `Set-Cookie` header. Returns true if the jar changed.
    ///
    /// Empty values, `Max-Age<=0` and past `Expires` delete the cookie.
    pub fn apply_set_cookie(&mut self, set_cookie: &str) -> bool {
        let mut parts = set_cookie.split(';');
        let Some((name, value)) = parts.next().and_then(split_pair) else {
            return false;
        };

        let mut deleted = value.is_empty();
        for attr in parts {
            let Some((key, attr_value)) = attr.split_once('=') else {
                continue;
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "max-age" => {
                    if attr_value.trim().parse::<i64>().map(|v| v <= 0).unwrap_or(false) {
                        deleted = true;
                    }
                }
                "expires" => {
                    if is_past(attr_value.trim()) {
                        deleted = true;
                    }
                }
                _ => {}
            }
        }

        if deleted {
            self.remove(name)
        } else {
            self.set(name, value)
        }
    }
}

fn split_pair(pair: &str) -> Option<(&str, &str)> {
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name, value.trim()))
}

/// ASP.NET writes `Thu, 01-Jan-1970 00:00:00 GMT`; browsers also accept spaces.
fn is_past(expires: &str) -> bool {
    let normalized = expires.replace('-', " ");
    NaiveDateTime::parse_from_str(&normalized, "%a, %d %b %Y %H:%M:%S GMT")
        .map(|at| at.and_utc() < Utc::now())
        .unwrap_or(false)
}

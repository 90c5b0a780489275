//! Pluggable transport arguments
//!
//! Clients pass per-connection transport arguments inside the SOCKS5
//! username/password sub-negotiation, encoded as `key=value;key=value`.
//! Backslash escapes `\`, `;` and `=` inside keys and values.

use anyhow::{Result, bail};

/// PtArgs is an ordered mapping from argument name to value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PtArgs {
    entries: Vec<(String, String)>,
}

impl PtArgs {
    /// new returns an empty argument set
    pub fn new() -> Self {
        Self::default()
    }

    /// get returns the value stored for name, if any
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// set replaces the value for name, keeping its position, or appends it
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// merge_extra fills in controller-supplied arguments. A connection
    /// argument wins unless it is missing or empty; empty extra values
    /// never overwrite anything
    pub fn merge_extra(&mut self, extra: &PtArgs) {
        for (name, value) in extra.iter() {
            if value.is_empty() {
                continue;
            }
            if self.get(name).is_none_or(str::is_empty) {
                self.set(name, value);
            }
        }
    }

    /// parse decodes a client argument string. An empty string is an
    /// empty argument set
    pub fn parse(raw: &str) -> Result<Self> {
        let mut args = PtArgs::new();
        if raw.is_empty() {
            return Ok(args);
        }

        let mut key = String::new();
        let mut value = String::new();
        let mut in_value = false;
        let mut chars = raw.chars();

        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    let Some(escaped) = chars.next() else {
                        bail!("nothing following final escape in {raw:?}");
                    };
                    if in_value {
                        value.push(escaped);
                    } else {
                        key.push(escaped);
                    }
                }
                '=' if !in_value => {
                    if key.is_empty() {
                        bail!("empty key in {raw:?}");
                    }
                    in_value = true;
                }
                ';' => {
                    if !in_value {
                        bail!("found no '=' in {key:?}");
                    }
                    args.add_first(std::mem::take(&mut key), std::mem::take(&mut value));
                    in_value = false;
                }
                _ if in_value => value.push(c),
                _ => key.push(c),
            }
        }

        if !in_value {
            bail!("found no '=' in {key:?}");
        }
        args.add_first(key, value);

        Ok(args)
    }

    /// add_first appends name unless it is already present; a repeated
    /// key keeps its first value
    fn add_first(&mut self, name: String, value: String) {
        if self.get(&name).is_none() {
            self.entries.push((name, value));
        }
    }

    /// encode is the inverse of parse
    pub fn encode(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| format!("{}={}", escape(k), escape(v)))
            .collect::<Vec<_>>()
            .join(";")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PtArgs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut args = PtArgs::new();
        for (k, v) in iter {
            args.set(k, v);
        }
        args
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | ';' | '=') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

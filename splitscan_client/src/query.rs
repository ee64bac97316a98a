use std::{collections::BTreeSet, sync::Arc};

use crate::value::{QueryParams, Value};

/// An immutable SQL statement and the named parameters bound to it
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    sql: Arc<str>,
    params: QueryParams,
}

impl Query {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: Arc::from(sql.into()),
            params: QueryParams::new(),
        }
    }

    pub fn with_params(mut self, params: QueryParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name, value);
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &QueryParams {
        &self.params
    }

    /// Names of the `@name` parameters referenced by the SQL text
    ///
    /// Quoted strings, quoted identifiers and comments are skipped, as are `@@` system
    /// variables.
    pub fn referenced_params(&self) -> BTreeSet<&str> {
        let sql: &str = &self.sql;
        let bytes = sql.as_bytes();
        let mut names = BTreeSet::new();
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                quote @ (b'\'' | b'"' | b'`') => {
                    i += 1;
                    while i < bytes.len() && bytes[i] != quote {
                        if bytes[i] == b'\\' {
                            i += 1;
                        }
                        i += 1;
                    }
                    i += 1;
                }
                b'-' if bytes.get(i + 1) == Some(&b'-') => i = skip_line(bytes, i),
                b'#' => i = skip_line(bytes, i),
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    i += 2;
                    while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/'))
                    {
                        i += 1;
                    }
                    i += 2;
                }
                b'@' => {
                    let system_variable = bytes.get(i + 1) == Some(&b'@');
                    let start = if system_variable { i + 2 } else { i + 1 };
                    let end = identifier_end(bytes, start);
                    if !system_variable && end > start && !bytes[start].is_ascii_digit() {
                        names.insert(&sql[start..end]);
                    }
                    i = end.max(i + 1);
                }
                _ => i += 1,
            }
        }
        names
    }

    /// Whether the SQL text references the parameter `name`, ignoring ASCII case
    pub fn references_param(&self, name: &str) -> bool {
        self.referenced_params()
            .iter()
            .any(|referenced| referenced.eq_ignore_ascii_case(name))
    }
}

fn skip_line(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i] != b'\n' {
        i += 1;
    }
    i
}

fn identifier_end(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
        i += 1;
    }
    i
}

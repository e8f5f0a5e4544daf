//! Query execution: send an OQL string, decode every row with the codec.

use std::vec;

use gkv_common::{decode_pair, RespValue, CMD_QUERY};
use tracing::debug;

use crate::client::{ClientError, ClientInner, ClientResult};
use crate::codec::RegionValue;

/// Rows of a query, in the order the node returned them.
///
/// Forward-only and single-pass; past the end it keeps yielding `None`.
#[derive(Debug)]
pub struct ResultSet<R> {
    rows: vec::IntoIter<R>,
}

impl<R> ResultSet<R> {
    fn new(rows: Vec<R>) -> Self {
        ResultSet {
            rows: rows.into_iter(),
        }
    }

    /// Rows not yet consumed.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.len() == 0
    }
}

impl<R> Iterator for ResultSet<R> {
    type Item = R;

    fn next(&mut self) -> Option<R> {
        self.rows.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

impl<R> ExactSizeIterator for ResultSet<R> {}

/// Scopes `query` to `region`.
///
/// A full `SELECT` statement is kept as written; anything else is a
/// predicate over the region's values.
pub(crate) fn scoped_query(region: &str, query: &str) -> String {
    let trimmed = query.trim();
    let is_select = match (trimmed.get(..6), trimmed.get(6..)) {
        (Some(head), Some(rest)) => {
            head.eq_ignore_ascii_case("select") && rest.starts_with(char::is_whitespace)
        }
        _ => false,
    };
    if is_select {
        trimmed.to_string()
    } else {
        format!("SELECT * FROM /{} this WHERE {}", region, trimmed)
    }
}

pub(crate) fn execute<R: RegionValue>(
    client: &ClientInner,
    query: &str,
) -> ClientResult<ResultSet<R>> {
    if query.trim().is_empty() {
        return Err(ClientError::Query("empty query string".to_string()));
    }

    let rows = match client.exec(&[CMD_QUERY, query.as_bytes()])? {
        RespValue::Array(rows) => rows,
        RespValue::Error(message) => return Err(ClientError::from_reply(message)),
        _ => return Err(ClientError::UnexpectedResponse),
    };

    let mut decoded = Vec::with_capacity(rows.len());
    for row in rows {
        match decode_pair(row)? {
            Some(wire) => decoded.push(R::decode(wire, &client.codec)?),
            // Projection of a null field.
            None => continue,
        }
    }
    debug!(query, rows = decoded.len(), "query executed");
    Ok(ResultSet::new(decoded))
}

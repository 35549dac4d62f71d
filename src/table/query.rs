//! Where-expression AST and subset descriptor (`spec.md` §3, §4.4).
//!
//! Crate-owned rather than borrowed from the `surrealdb` crate: keeping
//! the translation logic here means it can be unit-tested without a live
//! database connection, at the cost of the embedder's `RemoteDatabase`
//! having to understand this crate's SurrealQL-shaped text rather than
//! reusing a query builder wholesale.

use crate::error::AdapterError;
use crate::value::FieldValue;
use std::fmt::Write as _;

/// Comparison operators for [`WhereExpr::Cmp`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl Op {
    fn as_surql(self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Neq => "!=",
            Op::Lt => "<",
            Op::Lte => "<=",
            Op::Gt => ">",
            Op::Gte => ">=",
        }
    }
}

/// The right-hand side of a comparison: a literal value, or a reference
/// to another field on the same row. Field references are rejected at
/// translation time (`spec.md` §4.4) — the subset language has no
/// concept of a reactive read on the RHS.
#[derive(Clone, Debug)]
pub enum Rhs {
    Literal(FieldValue),
    FieldRef(String),
}

impl From<FieldValue> for Rhs {
    fn from(v: FieldValue) -> Self {
        Rhs::Literal(v)
    }
}

/// A where-expression tree.
#[derive(Clone, Debug)]
pub enum WhereExpr {
    And(Vec<WhereExpr>),
    Or(Vec<WhereExpr>),
    Not(Box<WhereExpr>),
    Cmp { field: String, op: Op, value: Rhs },
    Like { field: String, value: Rhs, case_insensitive: bool },
    In { field: String, values: Vec<FieldValue> },
    IsNull { field: String },
    IsNone { field: String },
}

struct Bindings {
    map: serde_json::Map<String, serde_json::Value>,
}

impl Bindings {
    fn new() -> Self {
        Self {
            map: serde_json::Map::new(),
        }
    }

    fn bind(&mut self, value: serde_json::Value) -> String {
        let name = format!("p{}", self.map.len());
        self.map.insert(name.clone(), value);
        format!("${name}")
    }
}

/// Rewrites `from`/`to` to the remote's edge fields `in`/`out` for
/// edge-relation tables (`spec.md` §4.4).
fn field_name(field: &str, is_edge: bool) -> &str {
    if is_edge {
        match field {
            "from" => "in",
            "to" => "out",
            other => other,
        }
    } else {
        field
    }
}

fn render_rhs(rhs: &Rhs, bindings: &mut Bindings) -> Result<String, AdapterError> {
    match rhs {
        Rhs::Literal(v) => Ok(bindings.bind(v.to_json())),
        Rhs::FieldRef(name) => Err(AdapterError::Translation(format!(
            "right-hand side field reference to {name:?} is not supported"
        ))),
    }
}

fn render_where(expr: &WhereExpr, is_edge: bool, bindings: &mut Bindings) -> Result<String, AdapterError> {
    match expr {
        WhereExpr::And(items) => render_conjunction(items, "AND", is_edge, bindings),
        WhereExpr::Or(items) => render_conjunction(items, "OR", is_edge, bindings),
        WhereExpr::Not(inner) => {
            let rendered = render_where(inner, is_edge, bindings)?;
            Ok(format!("NOT ({rendered})"))
        }
        WhereExpr::Cmp { field, op, value } => {
            let field = field_name(field, is_edge);
            let rhs = render_rhs(value, bindings)?;
            Ok(format!("{field} {} {rhs}", op.as_surql()))
        }
        WhereExpr::Like {
            field,
            value,
            case_insensitive,
        } => {
            let field = field_name(field, is_edge);
            let rhs = render_rhs(value, bindings)?;
            if *case_insensitive {
                Ok(format!("string::lower({field}) LIKE string::lower({rhs})"))
            } else {
                Ok(format!("{field} LIKE {rhs}"))
            }
        }
        WhereExpr::In { field, values } => {
            let field = field_name(field, is_edge);
            if values.is_empty() {
                // Empty IN translates to `false`, not an empty-set query,
                // per `spec.md` §8's boundary behavior.
                return Ok("false".to_string());
            }
            let array = serde_json::Value::Array(values.iter().map(FieldValue::to_json).collect());
            let param = bindings.bind(array);
            Ok(format!("{field} IN {param}"))
        }
        WhereExpr::IsNull { field } => Ok(format!("{} IS NULL", field_name(field, is_edge))),
        WhereExpr::IsNone { field } => Ok(format!("{} IS NONE", field_name(field, is_edge))),
    }
}

fn render_conjunction(
    items: &[WhereExpr],
    joiner: &str,
    is_edge: bool,
    bindings: &mut Bindings,
) -> Result<String, AdapterError> {
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        parts.push(format!("({})", render_where(item, is_edge, bindings)?));
    }
    Ok(parts.join(&format!(" {joiner} ")))
}

/// An order-by clause.
#[derive(Clone, Debug)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

/// An opaque predicate object: where-tree, ordering, limit/offset, and an
/// optional pagination cursor (`spec.md` §3).
#[derive(Clone, Debug, Default)]
pub struct Subset {
    pub where_expr: Option<WhereExpr>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub cursor: Option<String>,
}

fn render_where_for_key(expr: &WhereExpr, out: &mut String) {
    match expr {
        WhereExpr::And(items) => render_conjunction_key(items, "AND", out),
        WhereExpr::Or(items) => render_conjunction_key(items, "OR", out),
        WhereExpr::Not(inner) => {
            out.push_str("NOT(");
            render_where_for_key(inner, out);
            out.push(')');
        }
        WhereExpr::Cmp { field, op, value } => {
            let _ = write!(out, "{field}{:?}{}", op, render_rhs_key(value));
        }
        WhereExpr::Like {
            field,
            value,
            case_insensitive,
        } => {
            let _ = write!(
                out,
                "LIKE({field},{},{case_insensitive})",
                render_rhs_key(value)
            );
        }
        WhereExpr::In { field, values } => {
            let _ = write!(out, "IN({field},[");
            for v in values {
                let _ = write!(out, "{},", v.to_json());
            }
            out.push(']');
            out.push(')');
        }
        WhereExpr::IsNull { field } => {
            let _ = write!(out, "NULL({field})");
        }
        WhereExpr::IsNone { field } => {
            let _ = write!(out, "NONE({field})");
        }
    }
}

fn render_rhs_key(rhs: &Rhs) -> String {
    match rhs {
        Rhs::Literal(v) => v.to_json().to_string(),
        Rhs::FieldRef(name) => format!("@{name}"),
    }
}

fn render_conjunction_key(items: &[WhereExpr], joiner: &str, out: &mut String) {
    out.push_str(joiner);
    out.push('[');
    for item in items {
        render_where_for_key(item, out);
        out.push(',');
    }
    out.push(']');
}

impl Subset {
    /// A stable canonical string the Subset Cache keys on (`spec.md`
    /// §4.5). Deterministic for a given tree: does not reorder AND/OR
    /// children, since two calls that build the same subset build it the
    /// same way.
    pub fn canonical_key(&self) -> String {
        let mut key = String::new();
        match &self.where_expr {
            Some(expr) => render_where_for_key(expr, &mut key),
            None => key.push_str("true"),
        }
        key.push_str("|order=[");
        for o in &self.order_by {
            let _ = write!(key, "{}:{},", o.field, if o.descending { "desc" } else { "asc" });
        }
        key.push(']');
        let _ = write!(
            key,
            "|limit={:?}|offset={:?}|cursor={:?}",
            self.limit, self.offset, self.cursor
        );
        key
    }

    /// Translates this subset into SurrealQL-shaped text plus parameter
    /// bindings, ready for `RemoteDatabase::query` (`spec.md` §6).
    pub fn to_surql(
        &self,
        table: &str,
        is_edge: bool,
    ) -> Result<(String, serde_json::Map<String, serde_json::Value>), AdapterError> {
        let mut bindings = Bindings::new();
        let mut sql = format!("SELECT * FROM {table}");
        if let Some(expr) = &self.where_expr {
            let rendered = render_where(expr, is_edge, &mut bindings)?;
            let _ = write!(sql, " WHERE {rendered}");
        }
        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            let clauses: Vec<String> = self
                .order_by
                .iter()
                .map(|o| {
                    format!(
                        "{} {}",
                        field_name(&o.field, is_edge),
                        if o.descending { "DESC" } else { "ASC" }
                    )
                })
                .collect();
            sql.push_str(&clauses.join(", "));
        }
        if let Some(limit) = self.limit {
            let _ = write!(sql, " LIMIT {limit}");
        }
        if let Some(offset) = self.offset {
            let _ = write!(sql, " START {offset}");
        }
        Ok((sql, bindings.map))
    }
}

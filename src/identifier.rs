//! Record identifier canonicalization and interning (`spec.md` §4.1).
//!
//! A record id is a pair `(table, key)` with canonical textual form
//! `"<table>:<key>"`. The host runtime's reactive comparators rely on
//! referential equality for foreign keys, so every textual, object, or
//! cross-runtime variant that denotes the same pair must resolve to one
//! shared, interned `RecordId` — not merely to equal strings.
//!
//! The runtime-type-sniffing this requires (string vs. object vs. nested
//! object) is modeled as dispatch over [`crate::value::FieldValue`]
//! rather than duck-typing, per the teacher's `DocId`/`PeerId` newtypes:
//! one small type, `FromStr`-like parsing, `Display` for the canonical
//! form.

use crate::value::FieldValue;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

struct RecordIdInner {
    table: Box<str>,
    key: Box<str>,
    canonical: Box<str>,
}

/// An interned `(table, key)` pair. Two `RecordId`s produced by the same
/// [`IdentityCache`] for equal canonical strings are the same `Arc`, so
/// `==` is pointer equality — exactly what the host's reactive
/// comparators need.
#[derive(Clone)]
pub struct RecordId(Arc<RecordIdInner>);

impl RecordId {
    pub fn table(&self) -> &str {
        &self.0.table
    }

    pub fn key(&self) -> &str {
        &self.0.key
    }

    pub fn as_canonical_str(&self) -> &str {
        &self.0.canonical
    }
}

impl PartialEq for RecordId {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for RecordId {}

impl Hash for RecordId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state)
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.0.canonical)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.canonical)
    }
}

/// `/^[A-Za-z_][A-Za-z0-9_-]*$/` without pulling in a regex dependency
/// for one shape check.
fn is_valid_table_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn strip_outer_quotes(s: &str) -> &str {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        let is_quote = |b: u8| b == b'\'' || b == b'"' || b == b'`';
        if is_quote(first) && first == last {
            return &s[1..s.len() - 1];
        }
    }
    s
}

fn strip_outer_brackets(s: &str) -> &str {
    if s.len() >= 2 && s.starts_with('<') && s.ends_with('>') {
        return &s[1..s.len() - 1];
    }
    let mut chars = s.chars();
    if let (Some('⟨'), Some('⟩')) = (chars.next(), s.chars().next_back()) {
        let start = '⟨'.len_utf8();
        let end = s.len() - '⟩'.len_utf8();
        if start <= end {
            return &s[start..end];
        }
    }
    s
}

/// The key may itself contain colons, brackets, or quotes; only the
/// first unescaped `:` is the table/key separator.
fn find_unescaped_colon(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b':' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

fn canonicalize_textual(s: &str) -> Option<(String, String)> {
    let unquoted = strip_outer_quotes(s.trim());
    let colon = find_unescaped_colon(unquoted)?;
    let table_part = &unquoted[..colon];
    if !is_valid_table_name(table_part) {
        return None;
    }
    let key_part = &unquoted[colon + 1..];
    if key_part.is_empty() {
        return None;
    }
    let key_part = strip_outer_quotes(strip_outer_brackets(key_part));
    if key_part.is_empty() {
        return None;
    }
    Some((table_part.to_string(), key_part.to_string()))
}

/// Resolves a bare id leaf (the `id` field of a `{table, id}` object, or
/// an already-nested variant) to a raw key string, without requiring it
/// to itself contain a `table:` prefix.
fn raw_key_of(v: &FieldValue) -> Option<String> {
    match v {
        FieldValue::String(s) => {
            let unwrapped = strip_outer_quotes(strip_outer_brackets(s.trim()));
            if unwrapped.is_empty() {
                None
            } else {
                Some(unwrapped.to_string())
            }
        }
        FieldValue::Number(n) => Some(n.to_string()),
        FieldValue::RecordId(id) => Some(id.key().to_string()),
        _ => None,
    }
}

/// `toCanonicalString(input) -> string|none`: the canonical
/// `"<table>:<key>"` iff `input` denotes a record id. Never panics on
/// arbitrary data.
pub fn to_canonical_string(input: &FieldValue) -> Option<String> {
    match input {
        FieldValue::String(s) => {
            canonicalize_textual(s).map(|(table, key)| format!("{table}:{key}"))
        }
        FieldValue::RecordId(id) => Some(id.as_canonical_str().to_string()),
        FieldValue::Object(map) => {
            let id_val = map.get("id")?;
            if let Some(table_val) = map.get("table") {
                let table = table_val.as_str()?;
                if !is_valid_table_name(table) {
                    return None;
                }
                let key = raw_key_of(id_val)?;
                Some(format!("{table}:{key}"))
            } else {
                // `{id: <any variant>}` — unwrap one layer and recurse.
                to_canonical_string(id_val)
            }
        }
        _ => None,
    }
}

/// `keyOf(input) -> string`: the key portion after the first unescaped
/// `:`. Defined in terms of canonicalization so textual and object
/// variants agree.
pub fn key_of(input: &FieldValue) -> Option<String> {
    let canonical = to_canonical_string(input)?;
    let colon = canonical.find(':')?;
    Some(canonical[colon + 1..].to_string())
}

/// A sentinel-prefixed temporary id for a locally-created row the remote
/// hasn't assigned a real key to yet (`spec.md` §4.6's insert callback,
/// §4.7's schema validation). Both callers generate these the same way,
/// hence one shared function rather than two ad hoc ones.
pub fn temporary_id(table: &str) -> String {
    let mut buf = [0u8; 16];
    getrandom::getrandom(&mut buf).expect("system randomness source must be available");
    format!("{table}:tmp_{}", hex::encode(buf))
}

/// A process-wide (per adapter instance) interning pool for [`RecordId`].
/// `spec.md` §5 calls the pool "process-wide... append-only"; `spec.md`
/// §9's design notes push back on that being literal module-level state,
/// so that tests can reset it — this crate resolves the tension by
/// giving every [`crate::adapter::Adapter`] its own `IdentityCache`,
/// shared (via `Arc`) by everything that instance's sync engine touches.
/// See DESIGN.md for the Open Question writeup.
#[derive(Default)]
pub struct IdentityCache {
    pool: Mutex<HashMap<Box<str>, Arc<RecordIdInner>>>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns an already-canonical `"<table>:<key>"` string. Infallible:
    /// the caller is responsible for having canonicalized first.
    pub fn intern_canonical(&self, table: &str, key: &str, canonical: &str) -> RecordId {
        let mut pool = self.pool.lock();
        if let Some(existing) = pool.get(canonical) {
            return RecordId(existing.clone());
        }
        let inner = Arc::new(RecordIdInner {
            table: table.into(),
            key: key.into(),
            canonical: canonical.into(),
        });
        pool.insert(canonical.into(), inner.clone());
        RecordId(inner)
    }

    /// `intern(input) -> RecordId`: resolves any documented variant to
    /// the process-wide interned reference for its canonical string.
    /// Returns `None` for inputs that do not denote a record id.
    pub fn intern(&self, input: &FieldValue) -> Option<RecordId> {
        let canonical = to_canonical_string(input)?;
        let colon = canonical.find(':')?;
        let (table, key) = (&canonical[..colon], &canonical[colon + 1..]);
        Some(self.intern_canonical(table, key, &canonical))
    }

    /// `normalizeDeep(value) -> value`: walks plain objects and arrays,
    /// replacing record-id-like leaves with their interned form. Dates,
    /// byte blobs, and anything else already tagged by a dedicated
    /// [`FieldValue`] variant pass through untouched.
    pub fn normalize_deep(&self, value: &mut FieldValue) {
        if let Some(id) = self.intern(value) {
            *value = FieldValue::RecordId(id);
            return;
        }
        match value {
            FieldValue::Array(items) => {
                for item in items {
                    self.normalize_deep(item);
                }
            }
            FieldValue::Object(map) => {
                for (_, v) in map.iter_mut() {
                    self.normalize_deep(v);
                }
            }
            _ => {}
        }
    }

    /// Number of distinct record ids interned so far. Grows monotonically
    /// (entries are never evicted), bounding memory by the number of
    /// distinct ids observed — `spec.md` §5's shared-resource policy.
    pub fn len(&self) -> usize {
        self.pool.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn s(v: &str) -> FieldValue {
        FieldValue::String(v.to_string())
    }

    fn obj(pairs: Vec<(&str, FieldValue)>) -> FieldValue {
        FieldValue::Object(pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    #[test]
    fn canonicalizes_quoted_and_bracketed_variants() {
        assert_eq!(
            to_canonical_string(&s("products:1")).as_deref(),
            Some("products:1")
        );
        assert_eq!(
            to_canonical_string(&s("'products:1'")).as_deref(),
            Some("products:1")
        );
        assert_eq!(
            to_canonical_string(&s("\"products:1\"")).as_deref(),
            Some("products:1")
        );
        assert_eq!(
            to_canonical_string(&s("products:⟨1⟩")).as_deref(),
            Some("products:1")
        );
        assert_eq!(
            to_canonical_string(&s("products:<1>")).as_deref(),
            Some("products:1")
        );
    }

    #[test]
    fn canonicalizes_object_variants() {
        let native = obj(vec![("table", s("products")), ("id", s("1"))]);
        assert_eq!(to_canonical_string(&native).as_deref(), Some("products:1"));

        let wrapped = obj(vec![("id", native.clone())]);
        assert_eq!(
            to_canonical_string(&wrapped).as_deref(),
            Some("products:1")
        );
    }

    #[test]
    fn rejects_non_table_shapes() {
        assert_eq!(to_canonical_string(&s("not-a-record-id")), None);
        assert_eq!(to_canonical_string(&s("1bad:key")), None);
        assert_eq!(to_canonical_string(&FieldValue::Null), None);
    }

    #[test]
    fn keeps_extra_colons_and_brackets_in_the_key() {
        assert_eq!(
            to_canonical_string(&s("logs:2024-01-01T00:00:00Z")).as_deref(),
            Some("logs:2024-01-01T00:00:00Z")
        );
    }

    #[test]
    fn s1_all_variants_intern_to_same_reference() {
        let cache = IdentityCache::new();
        let variants = vec![
            s("products:1"),
            s("'products:1'"),
            s("products:⟨1⟩"),
            obj(vec![("table", s("products")), ("id", s("1"))]),
            obj(vec![(
                "id",
                obj(vec![("table", s("products")), ("id", s("1"))]),
            )]),
        ];
        let interned: Vec<RecordId> = variants
            .iter()
            .map(|v| cache.intern(v).expect("should intern"))
            .collect();
        let first = &interned[0];
        for other in &interned[1..] {
            assert_eq!(first, other);
            assert!(Arc::ptr_eq(&first.0, &other.0));
        }
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn intern_is_idempotent_across_calls() {
        let cache = IdentityCache::new();
        let a = cache.intern(&s("products:1")).unwrap();
        let b = cache.intern(&s("products:1")).unwrap();
        assert!(Arc::ptr_eq(&a.0, &b.0));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn normalize_deep_leaves_unknown_shapes_alone() {
        let cache = IdentityCache::new();
        let mut value = obj(vec![
            ("id", s("products:1")),
            ("created", FieldValue::DateTime(chrono::Utc::now())),
            ("blob", FieldValue::Bytes(vec![1, 2, 3])),
            ("tag", s("not-an-id")),
        ]);
        cache.normalize_deep(&mut value);
        let map = value.as_object().unwrap();
        assert!(matches!(map.get("id"), Some(FieldValue::RecordId(_))));
        assert!(matches!(map.get("created"), Some(FieldValue::DateTime(_))));
        assert!(matches!(map.get("blob"), Some(FieldValue::Bytes(_))));
        assert_eq!(map.get("tag"), Some(&s("not-an-id")));
    }

    #[test]
    fn key_of_unwraps_brackets_and_quotes() {
        assert_eq!(key_of(&s("products:⟨1⟩")).as_deref(), Some("1"));
        assert_eq!(key_of(&s("'products:1'")).as_deref(), Some("1"));
    }

    proptest::proptest! {
        /// Generalizes S1: for any valid table/key pair, every documented
        /// spelling of the same record id interns to one pointer-equal
        /// `RecordId`, whatever the key happens to look like.
        #[test]
        fn identifier_normalization_is_spelling_independent(
            table in "[a-zA-Z_][a-zA-Z0-9_]{0,9}",
            key in "[a-zA-Z0-9]{1,10}",
        ) {
            let cache = IdentityCache::new();
            let native = obj(vec![("table", s(&table)), ("id", s(&key))]);
            let wrapped = obj(vec![("id", native.clone())]);
            let variants = vec![
                s(&format!("{table}:{key}")),
                s(&format!("'{table}:{key}'")),
                s(&format!("{table}:⟨{key}⟩")),
                native,
                wrapped,
            ];

            let interned: Vec<RecordId> = variants
                .iter()
                .map(|v| cache.intern(v).expect("every variant must canonicalize"))
                .collect();
            for other in &interned[1..] {
                proptest::prop_assert!(Arc::ptr_eq(&interned[0].0, &other.0));
            }
            proptest::prop_assert_eq!(cache.len(), 1);
        }
    }
}

//! `:name` parameter rewriting
//!
//! Bookkeeping SQL uses a single named-parameter dialect (`:name`). This
//! module rewrites it into whatever placeholder style the target driver
//! expects. A `:name` token only counts when the colon is not preceded by
//! another colon (`::int` casts) or a backslash escape, and the name is not
//! followed by a further word character. For positional styles, values are
//! emitted in first-occurrence order; a name used twice contributes its
//! value twice.

use std::collections::HashSet;

use super::core::{ParamStyle, Value};

/// Bind values produced by a rewrite, shaped for the target style
#[derive(Debug, Clone, PartialEq)]
pub enum Bound {
    Positional(Vec<Value>),
    Named(Vec<(String, Value)>),
}

impl Bound {
    /// Flatten into a positional value list. Named styles keep declaration
    /// order; drivers that truly bind by name should match on the variant
    /// instead.
    pub fn into_values(self) -> Vec<Value> {
        match self {
            Bound::Positional(values) => values,
            Bound::Named(pairs) => pairs.into_iter().map(|(_, v)| v).collect(),
        }
    }
}

/// Rewrite `sql` from `:name` style into `style`, returning the rewritten
/// statement and its bind values.
pub fn rewrite(style: ParamStyle, sql: &str, params: &[(&str, Value)]) -> (String, Bound) {
    if style == ParamStyle::Named || params.is_empty() {
        let bound = if style.is_positional() {
            Bound::Positional(Vec::new())
        } else {
            Bound::Named(
                params
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
            )
        };
        return (sql.to_string(), bound);
    }

    let names: HashSet<&str> = params.iter().map(|(k, _)| *k).collect();
    let value_of = |name: &str| -> Value {
        params
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Null)
    };

    let mut out = String::with_capacity(sql.len());
    let mut positional = Vec::new();
    let mut counter = 0usize;
    let mut prev: Option<char> = None;
    let mut chars = sql.char_indices().peekable();

    while let Some((ix, c)) = chars.next() {
        if c != ':' || matches!(prev, Some(':') | Some('\\')) {
            out.push(c);
            prev = Some(c);
            continue;
        }
        // Longest identifier run after the colon; the word-boundary rule
        // falls out of taking the maximal run.
        let start = ix + 1;
        let mut end = start;
        while let Some(&(_, nc)) = chars.peek() {
            if nc.is_alphanumeric() || nc == '_' {
                end += nc.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        let name = &sql[start..end];
        if name.is_empty() || !names.contains(name) {
            out.push(':');
            out.push_str(name);
            prev = name.chars().last().or(Some(':'));
            continue;
        }
        match style {
            ParamStyle::Qmark => out.push('?'),
            ParamStyle::Numbered => {
                counter += 1;
                out.push('$');
                out.push_str(&counter.to_string());
            }
            ParamStyle::Format => out.push_str("%s"),
            ParamStyle::PyFormat => {
                out.push_str("%(");
                out.push_str(name);
                out.push_str(")s");
            }
            ParamStyle::Named => unreachable!("handled above"),
        }
        if style.is_positional() {
            positional.push(value_of(name));
        }
        prev = name.chars().last();
    }

    let bound = if style.is_positional() {
        Bound::Positional(positional)
    } else {
        Bound::Named(
            params
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    };
    (out, bound)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(name: &str, v: i64) -> (&str, Value) {
        (name, Value::Int(v))
    }

    #[test]
    fn qmark_first_occurrence_order() {
        let (sql, bound) = rewrite(
            ParamStyle::Qmark,
            "INSERT INTO t (a, b) VALUES (:b, :a)",
            &[p("a", 1), p("b", 2)],
        );
        assert_eq!(sql, "INSERT INTO t (a, b) VALUES (?, ?)");
        assert_eq!(
            bound,
            Bound::Positional(vec![Value::Int(2), Value::Int(1)])
        );
    }

    #[test]
    fn repeated_name_repeats_value() {
        let (sql, bound) = rewrite(
            ParamStyle::Qmark,
            "SELECT :x WHERE a = :x",
            &[p("x", 9)],
        );
        assert_eq!(sql, "SELECT ? WHERE a = ?");
        assert_eq!(
            bound,
            Bound::Positional(vec![Value::Int(9), Value::Int(9)])
        );
    }

    #[test]
    fn numbered_placeholders() {
        let (sql, bound) = rewrite(
            ParamStyle::Numbered,
            "UPDATE t SET a = :a WHERE b = :b OR c = :a",
            &[p("a", 1), p("b", 2)],
        );
        assert_eq!(sql, "UPDATE t SET a = $1 WHERE b = $2 OR c = $3");
        assert_eq!(
            bound,
            Bound::Positional(vec![Value::Int(1), Value::Int(2), Value::Int(1)])
        );
    }

    #[test]
    fn pyformat_keeps_named_binding() {
        let (sql, bound) = rewrite(
            ParamStyle::PyFormat,
            "SELECT * FROM t WHERE a = :a",
            &[p("a", 1)],
        );
        assert_eq!(sql, "SELECT * FROM t WHERE a = %(a)s");
        assert_eq!(
            bound,
            Bound::Named(vec![("a".to_string(), Value::Int(1))])
        );
    }

    #[test]
    fn casts_and_escapes_are_untouched() {
        let (sql, bound) = rewrite(
            ParamStyle::Qmark,
            "SELECT a::int, '\\:a', :a FROM t",
            &[p("a", 1)],
        );
        assert_eq!(sql, "SELECT a::int, '\\:a', ? FROM t");
        assert_eq!(bound, Bound::Positional(vec![Value::Int(1)]));
    }

    #[test]
    fn longer_word_is_not_a_match() {
        let (sql, bound) = rewrite(
            ParamStyle::Qmark,
            "SELECT :idx FROM t WHERE a = :id",
            &[p("id", 1)],
        );
        assert_eq!(sql, "SELECT :idx FROM t WHERE a = ?");
        assert_eq!(bound, Bound::Positional(vec![Value::Int(1)]));
    }

    #[test]
    fn named_style_passes_through() {
        let (sql, bound) = rewrite(
            ParamStyle::Named,
            "SELECT :a",
            &[p("a", 1)],
        );
        assert_eq!(sql, "SELECT :a");
        assert_eq!(bound, Bound::Named(vec![("a".to_string(), Value::Int(1))]));
    }
}

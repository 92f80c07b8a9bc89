//! QuerySpec → parameterized SQL.
//!
//! Parameter aliases are `:<field>_p<n>`, numbered from 1 within a single
//! compile call, so the same query always compiles to the same text.

use rusqlite::types::ToSql;
use tracing::debug;

use crate::errors::{EngineError, Result};
use crate::query::spec::{Comparator, Connective, Predicate, QuerySpec};
use crate::query::UID_FIELD;
use crate::uid::UniqueId;
use crate::value::FieldValue;

const HIER_SOURCE: &str = "hier_src";
const HIER_TREE: &str = "hier_tree";

/// Depth column added by [`compile_hierarchical`]; source rows must not
/// carry a column of the same name.
pub const LEVEL_COLUMN: &str = "level";

/// SQL text plus its named bindings (names carry the leading `:`).
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub bindings: Vec<(String, FieldValue)>,
}

impl CompiledQuery {
    /// Bindings in the shape rusqlite takes for named parameters.
    pub fn params(&self) -> Vec<(&str, &dyn ToSql)> {
        self.bindings
            .iter()
            .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
            .collect()
    }

    pub fn binding(&self, name: &str) -> Option<&FieldValue> {
        self.bindings
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
}

/// Per-call compilation state.
struct Compiler {
    counter: u32,
    bindings: Vec<(String, FieldValue)>,
}

impl Compiler {
    fn new() -> Self {
        Self {
            counter: 0,
            bindings: Vec::new(),
        }
    }

    fn bind(&mut self, field: &str, value: FieldValue) -> String {
        self.counter += 1;
        let name = format!(":{}_p{}", alias_stem(field), self.counter);
        self.bindings.push((name.clone(), value));
        name
    }

    fn where_clause(&mut self, predicates: &[Predicate]) -> Result<String> {
        let mut out = String::new();
        for (i, predicate) in predicates.iter().enumerate() {
            if i > 0 {
                out.push(' ');
                out.push_str(predicate.connective.unwrap_or(Connective::And).keyword());
                out.push(' ');
            }
            out.push_str(&self.predicate(predicate)?);
        }
        Ok(out)
    }

    fn predicate(&mut self, predicate: &Predicate) -> Result<String> {
        check_identifier(&predicate.field)?;
        let lhs = match &predicate.function {
            Some(func) => {
                check_identifier(&func.name)?;
                match &func.arg {
                    Some(arg) => format!("{}({}, {})", func.name, predicate.field, arg.to_literal()),
                    None => format!("{}({})", func.name, predicate.field),
                }
            }
            None => predicate.field.clone(),
        };
        let op = predicate.comparator.operator();

        if predicate.raw {
            let text = match &predicate.value {
                FieldValue::String(sql) => sql.clone(),
                other => other.to_literal(),
            };
            return Ok(match predicate.comparator {
                Comparator::IsNull | Comparator::NotNull => format!("{lhs} {op}"),
                Comparator::In | Comparator::NotIn => format!("{lhs} {op} ({text})"),
                _ => format!("{lhs} {op} {text}"),
            });
        }

        if predicate.comparator.requires_raw() {
            return Err(EngineError::validation(format!(
                "comparator {op} on field {} requires a raw SQL operand",
                predicate.field
            )));
        }

        Ok(match (predicate.comparator, &predicate.value) {
            (Comparator::In | Comparator::NotIn, FieldValue::Array(items)) => {
                let aliases: Vec<String> = items
                    .iter()
                    .map(|item| self.bind(&predicate.field, item.clone()))
                    .collect();
                format!("{lhs} {op} ({})", aliases.join(", "))
            }
            (Comparator::In | Comparator::NotIn, value) => {
                let alias = self.bind(&predicate.field, value.clone());
                format!("{lhs} {op} ({alias})")
            }
            (_, value) => {
                let alias = self.bind(&predicate.field, value.clone());
                format!("{lhs} {op} {alias}")
            }
        })
    }

    fn finish(self, sql: String) -> CompiledQuery {
        debug!(sql = %sql, bindings = self.bindings.len(), "compiled query");
        CompiledQuery {
            sql,
            bindings: self.bindings,
        }
    }
}

/// Parameter stem for a field: identifier characters kept, the rest `_`.
fn alias_stem(field: &str) -> String {
    field
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Accepts `name`, `table.name` and `*`.
pub(crate) fn check_identifier(ident: &str) -> Result<()> {
    if ident == "*" {
        return Ok(());
    }
    let valid_segment = |seg: &str| {
        let mut chars = seg.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    if !ident.is_empty() && ident.split('.').all(|seg| seg == "*" || valid_segment(seg)) {
        Ok(())
    } else {
        Err(EngineError::validation(format!("invalid identifier: {ident:?}")))
    }
}

fn select_list(spec: &QuerySpec, extra: &[&str]) -> Result<String> {
    let mut items: Vec<String> = Vec::new();
    for field in extra {
        if !spec.fields.iter().any(|f| f == field) && !spec.fields.is_empty() {
            items.push((*field).to_string());
        }
    }
    for field in &spec.fields {
        check_identifier(field)?;
        items.push(field.clone());
    }
    for (expression, alias) in &spec.computed {
        check_identifier(alias)?;
        items.push(format!("{expression} AS {alias}"));
    }
    if items.is_empty() {
        items.push("*".to_string());
    } else if spec.fields.is_empty() {
        // Only computed columns were requested; keep the row columns too.
        items.insert(0, "*".to_string());
    }
    Ok(items.join(", "))
}

fn order_and_paging(spec: &QuerySpec, leading: Option<&str>) -> Result<String> {
    let mut out = String::new();
    let mut order: Vec<String> = leading.map(|l| vec![l.to_string()]).unwrap_or_default();
    for (field, direction) in &spec.order {
        check_identifier(field)?;
        order.push(format!("{field} {}", direction.keyword()));
    }
    if !order.is_empty() {
        out.push_str(" ORDER BY ");
        out.push_str(&order.join(", "));
    }
    match (spec.limit, spec.offset) {
        (Some(limit), Some(offset)) => out.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
        (Some(limit), None) => out.push_str(&format!(" LIMIT {limit}")),
        (None, Some(offset)) => out.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
        (None, None) => {}
    }
    Ok(out)
}

fn materialize(spec: &QuerySpec, select: String) -> Result<String> {
    match &spec.temp_table {
        Some(name) => {
            check_identifier(name)?;
            Ok(format!("CREATE TEMP TABLE {name} AS {select}"))
        }
        None => Ok(select),
    }
}

/// Compile a flat SELECT.
pub fn compile(spec: &QuerySpec) -> Result<CompiledQuery> {
    check_identifier(&spec.table)?;
    let mut compiler = Compiler::new();

    let mut sql = format!("SELECT {} FROM {}", select_list(spec, &[])?, spec.table);
    for join in &spec.joins {
        check_identifier(&join.table)?;
        check_identifier(&join.join_field)?;
        check_identifier(&join.parent_table)?;
        let target = match &join.alias {
            Some(alias) => {
                check_identifier(alias)?;
                sql.push_str(&format!(" {} {} AS {alias}", join.kind.keyword(), join.table));
                alias.as_str()
            }
            None => {
                sql.push_str(&format!(" {} {}", join.kind.keyword(), join.table));
                join.table.as_str()
            }
        };
        sql.push_str(&format!(
            " ON {target}.{UID_FIELD} = {}.{}",
            join.parent_table, join.join_field
        ));
    }
    if !spec.predicates.is_empty() {
        let clause = compiler.where_clause(&spec.predicates)?;
        sql.push_str(" WHERE ");
        sql.push_str(&clause);
    }
    sql.push_str(&order_and_paging(spec, None)?);

    let sql = materialize(spec, sql)?;
    Ok(compiler.finish(sql))
}

/// Compile a recursive expansion over `spec.parent_field`.
///
/// Roots are rows whose parent is the empty uid or NULL and get `level` 1;
/// each child gets its parent's level + 1. Rows are ordered by level first.
/// Predicates filter the source rows before expansion, so a filtered-out
/// node also hides its subtree. Parent links must form a forest: a cycle
/// makes the query run forever.
pub fn compile_hierarchical(spec: &QuerySpec) -> Result<CompiledQuery> {
    let parent = spec.parent_field.as_deref().ok_or_else(|| {
        EngineError::validation(format!("query on {} has no parent field", spec.table))
    })?;
    check_identifier(&spec.table)?;
    check_identifier(parent)?;
    if !spec.joins.is_empty() {
        return Err(EngineError::validation(
            "hierarchical queries do not support joins",
        ));
    }
    let clash = std::iter::once(parent)
        .chain(spec.fields.iter().map(String::as_str))
        .chain(spec.computed.iter().map(|(_, alias)| alias.as_str()))
        .find(|name| name.eq_ignore_ascii_case(LEVEL_COLUMN));
    if let Some(name) = clash {
        return Err(EngineError::validation(format!(
            "column {name:?} on {} collides with the hierarchy depth column",
            spec.table
        )));
    }
    let mut compiler = Compiler::new();

    let mut source = format!(
        "SELECT {} FROM {}",
        select_list(spec, &[UID_FIELD, parent])?,
        spec.table
    );
    if !spec.predicates.is_empty() {
        let clause = compiler.where_clause(&spec.predicates)?;
        source.push_str(" WHERE ");
        source.push_str(&clause);
    }

    let parent_col = format!("{HIER_SOURCE}.{parent}");
    let roots = [
        Predicate::new(parent_col.clone(), Comparator::Eq, UniqueId::empty()),
        Predicate::raw_sql(parent_col.clone(), Comparator::IsNull, "").or(),
    ];
    let root_clause = compiler.where_clause(&roots)?;

    let select = format!(
        "WITH RECURSIVE {HIER_SOURCE} AS ({source}), \
         {HIER_TREE} AS (\
         SELECT {HIER_SOURCE}.*, 1 AS {LEVEL_COLUMN} FROM {HIER_SOURCE} WHERE {root_clause} \
         UNION ALL \
         SELECT {HIER_SOURCE}.*, {HIER_TREE}.{LEVEL_COLUMN} + 1 FROM {HIER_SOURCE} \
         JOIN {HIER_TREE} ON {parent_col} = {HIER_TREE}.{UID_FIELD}) \
         SELECT * FROM {HIER_TREE}{}",
        order_and_paging(spec, Some(&format!("{LEVEL_COLUMN} ASC")))?
    );

    let sql = materialize(spec, select)?;
    Ok(compiler.finish(sql))
}

impl QuerySpec {
    pub fn compile(&self) -> Result<CompiledQuery> {
        compile(self)
    }

    pub fn compile_hierarchical(&self) -> Result<CompiledQuery> {
        compile_hierarchical(self)
    }
}

//! Declarative SELECT model.

use crate::value::FieldValue;

/// How a join attaches to the statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

impl JoinKind {
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Inner => "INNER JOIN",
            Self::Left => "LEFT JOIN",
        }
    }
}

/// `<kind> <table> AS <alias> ON <alias>.uid = <parent_table>.<join_field>`
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub table: String,
    pub join_field: String,
    pub parent_table: String,
    pub alias: Option<String>,
    pub kind: JoinKind,
}

impl Join {
    pub fn left(
        table: impl Into<String>,
        join_field: impl Into<String>,
        parent_table: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            join_field: join_field.into(),
            parent_table: parent_table.into(),
            alias: None,
            kind: JoinKind::Left,
        }
    }

    pub fn inner(
        table: impl Into<String>,
        join_field: impl Into<String>,
        parent_table: impl Into<String>,
    ) -> Self {
        Self {
            kind: JoinKind::Inner,
            ..Self::left(table, join_field, parent_table)
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

/// Comparison operator of a predicate.
///
/// `Gt`/`GtEq` are the "QT"/"QT_EQ" comparators of the metadata layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    Not,
    In,
    NotIn,
    Gt,
    Lt,
    GtEq,
    LtEq,
    Like,
    IsNull,
    NotNull,
    Between,
}

impl Comparator {
    /// Operators that only make sense with an inlined SQL operand.
    pub fn requires_raw(&self) -> bool {
        matches!(self, Self::IsNull | Self::NotNull | Self::Between)
    }

    pub fn operator(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Not => "<>",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::GtEq => ">=",
            Self::LtEq => "<=",
            Self::Like => "LIKE",
            Self::IsNull => "IS NULL",
            Self::NotNull => "IS NOT NULL",
            Self::Between => "BETWEEN",
        }
    }
}

/// Boolean glue placed before a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connective {
    And,
    Or,
    AndNot,
    OrNot,
}

impl Connective {
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
            Self::AndNot => "AND NOT",
            Self::OrNot => "OR NOT",
        }
    }
}

/// SQL function wrapped around a predicate's field, e.g. `date(period)` or
/// `substr(code, 1)`.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFunction {
    pub name: String,
    pub arg: Option<FieldValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub field: String,
    pub comparator: Comparator,
    pub value: FieldValue,
    /// Ignored on the first predicate; `AND` when unset.
    pub connective: Option<Connective>,
    /// Inline `value` as SQL text instead of binding it.
    pub raw: bool,
    pub function: Option<SqlFunction>,
}

impl Predicate {
    pub fn new(field: impl Into<String>, comparator: Comparator, value: impl Into<FieldValue>) -> Self {
        Self {
            field: field.into(),
            comparator,
            value: value.into(),
            connective: None,
            raw: false,
            function: None,
        }
    }

    /// Predicate whose operand is SQL text, e.g. `IS NULL` or `BETWEEN 1 AND 5`.
    pub fn raw_sql(field: impl Into<String>, comparator: Comparator, sql: impl Into<String>) -> Self {
        Self {
            raw: true,
            ..Self::new(field, comparator, FieldValue::String(sql.into()))
        }
    }

    pub fn connective(mut self, connective: Connective) -> Self {
        self.connective = Some(connective);
        self
    }

    pub fn or(self) -> Self {
        self.connective(Connective::Or)
    }

    pub fn and_not(self) -> Self {
        self.connective(Connective::AndNot)
    }

    pub fn or_not(self) -> Self {
        self.connective(Connective::OrNot)
    }

    pub fn wrapped(mut self, name: impl Into<String>, arg: Option<FieldValue>) -> Self {
        self.function = Some(SqlFunction {
            name: name.into(),
            arg,
        });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// A SELECT statement in declarative form.
///
/// Collections are public: callers may push and pop predicates between
/// compiles to derive specialized variants of one query.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    pub table: String,
    pub fields: Vec<String>,
    /// `(expression, alias)` pairs, emitted verbatim.
    pub computed: Vec<(String, String)>,
    pub joins: Vec<Join>,
    pub predicates: Vec<Predicate>,
    pub order: Vec<(String, SortDirection)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Materialize the result into this temp table.
    pub temp_table: Option<String>,
    /// Parent-link column for hierarchical compilation.
    pub parent_field: Option<String>,
}

impl QuerySpec {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            fields: Vec::new(),
            computed: Vec::new(),
            joins: Vec::new(),
            predicates: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
            temp_table: None,
            parent_field: None,
        }
    }

    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.fields.push(field.into());
        self
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn computed(mut self, expression: impl Into<String>, alias: impl Into<String>) -> Self {
        self.computed.push((expression.into(), alias.into()));
        self
    }

    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    pub fn filter(self, field: impl Into<String>, comparator: Comparator, value: impl Into<FieldValue>) -> Self {
        self.predicate(Predicate::new(field, comparator, value))
    }

    pub fn predicate(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Ordering by `field`; a repeated field keeps its position and takes the new direction.
    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        let field = field.into();
        match self.order.iter_mut().find(|(f, _)| *f == field) {
            Some(entry) => entry.1 = direction,
            None => self.order.push((field, direction)),
        }
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn into_temp_table(mut self, name: impl Into<String>) -> Self {
        self.temp_table = Some(name.into());
        self
    }

    pub fn hierarchy(mut self, parent_field: impl Into<String>) -> Self {
        self.parent_field = Some(parent_field.into());
        self
    }

    pub fn push_predicate(&mut self, predicate: Predicate) {
        self.predicates.push(predicate);
    }

    pub fn pop_predicate(&mut self) -> Option<Predicate> {
        self.predicates.pop()
    }

    pub fn clear_predicates(&mut self) {
        self.predicates.clear();
    }
}
